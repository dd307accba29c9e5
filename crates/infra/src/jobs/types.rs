//! Core job types and policies.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shoptrack_ai::Partition;
use shoptrack_core::config::RetrySettings;
use shoptrack_core::{ErrorClass, JobId, ModelVersion, PipelineError};

/// Job kind for routing to the matching handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Retrain,
    Predict,
    Evaluate,
    /// Marks expired alerts.
    Cleanup,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [JobKind::Retrain, JobKind::Predict, JobKind::Evaluate, JobKind::Cleanup];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Retrain => "retrain",
            JobKind::Predict => "predict",
            JobKind::Evaluate => "evaluate",
            JobKind::Cleanup => "cleanup",
        }
    }

    /// Whether jobs of this kind are split across item partitions.
    pub fn is_partitioned(&self) -> bool {
        matches!(self, JobKind::Predict | JobKind::Evaluate)
    }
}

impl FromStr for JobKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retrain" => Ok(JobKind::Retrain),
            "predict" => Ok(JobKind::Predict),
            "evaluate" => Ok(JobKind::Evaluate),
            "cleanup" => Ok(JobKind::Cleanup),
            other => Err(PipelineError::invalid_input(format!("unknown job kind '{other}'"))),
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Claimed by a worker; the claim lapses at `lease_expires_at`
    Running,
    /// Side effects committed. Data-quality problems finish here with a warning.
    Succeeded { warning: Option<String> },
    /// Failed, will be retried once `not_before` passes
    Failed { error: String, attempt: u32 },
    /// Out of attempts, superseded, or hit a fatal error
    Abandoned { reason: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Abandoned { .. })
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded { .. } => "SUCCEEDED",
            JobStatus::Failed { .. } => "FAILED",
            JobStatus::Abandoned { .. } => "ABANDONED",
        }
    }
}

/// Status names accepted by `list_by_status` filters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatusFilter {
    Pending,
    Running,
    Succeeded,
    Failed,
    Abandoned,
}

impl JobStatusFilter {
    pub fn matches(&self, status: &JobStatus) -> bool {
        status.name() == self.name()
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobStatusFilter::Pending => "PENDING",
            JobStatusFilter::Running => "RUNNING",
            JobStatusFilter::Succeeded => "SUCCEEDED",
            JobStatusFilter::Failed => "FAILED",
            JobStatusFilter::Abandoned => "ABANDONED",
        }
    }
}

impl FromStr for JobStatusFilter {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatusFilter::Pending),
            "RUNNING" => Ok(JobStatusFilter::Running),
            "SUCCEEDED" => Ok(JobStatusFilter::Succeeded),
            "FAILED" => Ok(JobStatusFilter::Failed),
            "ABANDONED" => Ok(JobStatusFilter::Abandoned),
            other => Err(PipelineError::invalid_input(format!("unknown job status '{other}'"))),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before the job is abandoned.
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Factor applied while no model is published yet.
    pub cold_start_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_retries,
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            cold_start_multiplier: settings.cold_start_multiplier,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            cold_start_multiplier: 1,
        }
    }

    /// Delay before the retry that follows `attempt` (1-indexed): `base * 2^(attempt-1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff for a failure of the given class. Cold starts wait longer.
    pub fn delay_for(&self, attempt: u32, class: ErrorClass) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        match class {
            ErrorClass::ModelUnavailable => {
                delay.saturating_mul(self.cold_start_multiplier.max(1))
            }
            _ => delay,
        }
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// How a job came to be queued.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    Scheduled,
    /// The single deferred run fired after scheduler downtime.
    CatchUp,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub partition: Partition,
    /// Model version pinned on first execution; reused by every re-execution.
    pub pinned_model_version: Option<ModelVersion>,
    pub origin: JobOrigin,
}

impl Default for JobPayload {
    fn default() -> Self {
        Self {
            partition: Partition::ALL,
            pinned_model_version: None,
            origin: JobOrigin::Scheduled,
        }
    }
}

/// A queued unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far.
    pub attempt: u32,
    /// Slot time this job stands for; also the `produced_at` of its records.
    pub scheduled_at: DateTime<Utc>,
    /// Earliest time the job may be claimed (backoff).
    pub not_before: DateTime<Utc>,
    /// Visibility deadline of the current claim.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// A retry older than this (relative to `scheduled_at`) is superseded.
    pub supersede_after: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Execution history (errors from previous attempts)
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

fn chrono_delay(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl Job {
    /// Job for one scheduled slot.
    ///
    /// The id is derived from kind, slot and partition, so enqueuing the same slot twice
    /// is rejected by the queue as a duplicate.
    pub fn scheduled(kind: JobKind, slot_at: DateTime<Utc>, partition: Partition, now: DateTime<Utc>) -> Self {
        let name = format!(
            "{}:{}:{}:{}",
            kind.as_str(),
            slot_at.timestamp(),
            partition.index,
            partition.count
        );
        let mut job = Self::new(JobId::deterministic(&name), kind, slot_at, now);
        job.payload.partition = partition;
        job
    }

    /// One-off job (e.g. an operator-triggered retrain).
    pub fn manual(kind: JobKind, now: DateTime<Utc>) -> Self {
        let mut job = Self::new(JobId::new(), kind, now, now);
        job.payload.origin = JobOrigin::Manual;
        job
    }

    fn new(id: JobId, kind: JobKind, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            payload: JobPayload::default(),
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            scheduled_at,
            not_before: now,
            lease_expires_at: None,
            supersede_after: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Set a custom retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_origin(mut self, origin: JobOrigin) -> Self {
        self.payload.origin = origin;
        self
    }

    pub fn superseded_after(mut self, interval: Duration) -> Self {
        self.supersede_after = Some(interval);
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && now >= self.not_before
    }

    /// A retry whose slot is more than one interval old has been superseded by a fresher run.
    ///
    /// Checked on a claimed job, so `attempt` already counts the current claim and a
    /// late first attempt still runs.
    pub fn is_superseded(&self, now: DateTime<Utc>) -> bool {
        self.attempt > 1
            && self
                .supersede_after
                .is_some_and(|interval| now - self.scheduled_at > chrono_delay(interval))
    }

    /// Mark job as running under a claim that lapses after `visibility`.
    pub fn mark_running(&mut self, now: DateTime<Utc>, visibility: Duration) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.lease_expires_at = Some(now + chrono_delay(visibility));
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, warning: Option<String>, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.record_attempt(started_at, now, warning.clone().map(|w| format!("warning: {w}")), true);
        self.status = JobStatus::Succeeded { warning };
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    /// Record a failed attempt and decide between retry and abandonment.
    ///
    /// Only transient infrastructure errors and cold starts are retried.
    pub fn mark_failed(&mut self, error: &PipelineError, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        let message = error.to_string();
        self.record_attempt(started_at, now, Some(message.clone()), false);
        self.lease_expires_at = None;
        self.updated_at = now;

        if error.is_retryable() && self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for(self.attempt, error.class());
            self.not_before = now + chrono_delay(delay);
            self.status = JobStatus::Failed {
                error: message,
                attempt: self.attempt,
            };
        } else if error.is_retryable() {
            self.status = JobStatus::Abandoned {
                reason: format!("retries exhausted: {message}"),
                attempts: self.attempt,
            };
        } else {
            self.status = JobStatus::Abandoned {
                reason: message,
                attempts: self.attempt,
            };
        }
    }

    pub fn mark_abandoned(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Abandoned {
            reason: reason.into(),
            attempts: self.attempt,
        };
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>, error: Option<String>, success: bool) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Success,
    /// Completed, but the input was unusable; retrying won't help.
    SuccessWithWarning(String),
    Failed(PipelineError),
}

impl From<Result<(), PipelineError>> for JobResult {
    fn from(res: Result<(), PipelineError>) -> Self {
        match res {
            Ok(()) => JobResult::Success,
            Err(e) if e.class() == ErrorClass::DataQuality => JobResult::SuccessWithWarning(e.to_string()),
            Err(e) => JobResult::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            cold_start_multiplier: 8,
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn cold_start_backs_off_longer() {
        let policy = policy();
        assert_eq!(
            policy.delay_for(1, ErrorClass::ModelUnavailable),
            Duration::from_millis(800)
        );
        assert_eq!(policy.delay_for(1, ErrorClass::TransientInfra), Duration::from_millis(100));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = policy();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn scheduled_ids_are_deterministic() {
        let a = Job::scheduled(JobKind::Predict, t0(), Partition::ALL, t0());
        let b = Job::scheduled(JobKind::Predict, t0(), Partition::ALL, t0() + chrono::Duration::seconds(5));
        let c = Job::scheduled(JobKind::Evaluate, t0(), Partition::ALL, t0());
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::scheduled(JobKind::Predict, t0(), Partition::ALL, t0());
        assert!(job.is_ready(t0()));

        job.mark_running(t0(), Duration::from_secs(30));
        assert_eq!(job.attempt, 1);
        assert_eq!(job.lease_expires_at, Some(t0() + chrono::Duration::seconds(30)));

        job.mark_succeeded(None, t0(), t0());
        assert!(job.status.is_terminal());
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
    }

    #[test]
    fn transient_failures_retry_then_abandon() {
        let mut job = Job::scheduled(JobKind::Retrain, t0(), Partition::ALL, t0()).with_retry_policy(policy());
        let err = PipelineError::store("db down");

        for expected in 1..=2u32 {
            job.mark_running(t0(), Duration::from_secs(30));
            job.mark_failed(&err, t0(), t0());
            assert_eq!(
                job.status,
                JobStatus::Failed {
                    error: err.to_string(),
                    attempt: expected
                }
            );
        }
        assert_eq!(job.not_before, t0() + chrono::Duration::milliseconds(200));

        job.mark_running(t0(), Duration::from_secs(30));
        job.mark_failed(&err, t0(), t0());
        assert!(matches!(job.status, JobStatus::Abandoned { attempts: 3, .. }));
    }

    #[test]
    fn invariant_violation_abandons_immediately() {
        let mut job = Job::scheduled(JobKind::Retrain, t0(), Partition::ALL, t0());
        job.mark_running(t0(), Duration::from_secs(30));
        job.mark_failed(&PipelineError::invariant("two current pointers"), t0(), t0());
        assert!(matches!(job.status, JobStatus::Abandoned { attempts: 1, .. }));
    }

    #[test]
    fn data_quality_errors_become_warnings() {
        let res: JobResult = Err(PipelineError::insufficient("3 hours")).into();
        assert!(matches!(res, JobResult::SuccessWithWarning(_)));
        let res: JobResult = Err(PipelineError::ModelUnavailable).into();
        assert_eq!(res, JobResult::Failed(PipelineError::ModelUnavailable));
    }

    #[test]
    fn retries_are_superseded_after_one_interval() {
        let mut job = Job::scheduled(JobKind::Predict, t0(), Partition::ALL, t0())
            .superseded_after(Duration::from_secs(3600));
        assert!(!job.is_superseded(t0() + chrono::Duration::hours(5)));

        // First claim, however late, is not a retry.
        job.mark_running(t0() + chrono::Duration::hours(2), Duration::from_secs(30));
        assert!(!job.is_superseded(t0() + chrono::Duration::hours(2)));

        job.mark_failed(&PipelineError::store("db down"), t0(), t0() + chrono::Duration::hours(2));
        job.mark_running(t0(), Duration::from_secs(30));
        assert!(!job.is_superseded(t0() + chrono::Duration::minutes(59)));
        assert!(job.is_superseded(t0() + chrono::Duration::minutes(61)));
    }
}
