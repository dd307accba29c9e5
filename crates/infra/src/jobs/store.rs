//! Job queue storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use shoptrack_core::{JobId, PipelineError};

use super::types::{Job, JobKind, JobStatus, JobStatusFilter};

/// Which jobs a worker is willing to claim right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimFilter {
    /// False while this process already runs a RETRAIN.
    pub allow_retrain: bool,
}

impl Default for ClaimFilter {
    fn default() -> Self {
        Self { allow_retrain: true }
    }
}

/// Queue abstraction with at-least-once delivery.
///
/// A claimed job is invisible to other workers until its visibility lease
/// lapses; `reap_expired` then re-delivers it.
pub trait JobStore: Send + Sync {
    /// Enqueue a new job. Fails with `AlreadyExists` for a known id.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Write back a job. Terminal jobs are immutable and a worker whose claim
    /// was superseded by a newer attempt cannot overwrite it.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest ready job and mark it RUNNING.
    ///
    /// RETRAIN jobs are only handed out when no other RETRAIN holds a live claim.
    fn claim_next(
        &self,
        now: DateTime<Utc>,
        visibility: Duration,
        filter: ClaimFilter,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Release claims whose visibility lease lapsed. Returns the jobs changed.
    fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    fn list_by_status(
        &self,
        status: Option<JobStatusFilter>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    fn list_by_kind(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {0} is terminal and cannot change")]
    Terminal(JobId),
    #[error("job {0} was re-claimed by a newer attempt")]
    StaleClaim(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for PipelineError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::Storage(msg) => PipelineError::StoreUnavailable(msg),
            // Expected under at-least-once delivery; the newer claim owns the job.
            lost @ (JobStoreError::Terminal(_) | JobStoreError::StaleClaim(_)) => {
                PipelineError::StoreUnavailable(format!("claim lost: {lost}"))
            }
            other => PipelineError::InvariantViolation(other.to_string()),
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub succeeded_with_warning: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl JobStats {
    pub fn count(&mut self, status: &JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded { warning: None } => self.succeeded += 1,
            JobStatus::Succeeded { warning: Some(_) } => {
                self.succeeded += 1;
                self.succeeded_with_warning += 1;
            }
            JobStatus::Failed { .. } => self.failed += 1,
            JobStatus::Abandoned { .. } => self.abandoned += 1,
        }
    }
}

fn lock_err<T>(_: std::sync::PoisonError<T>) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn retrain_in_flight(jobs: &HashMap<JobId, Job>, now: DateTime<Utc>) -> bool {
    jobs.values().any(|j| {
        j.kind == JobKind::Retrain
            && j.status == JobStatus::Running
            && j.lease_expires_at.is_some_and(|exp| exp > now)
    })
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(lock_err)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(lock_err)?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(lock_err)?;
        let stored = jobs.get(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if stored.status.is_terminal() {
            return Err(JobStoreError::Terminal(job.id));
        }
        if stored.attempt > job.attempt {
            return Err(JobStoreError::StaleClaim(job.id));
        }
        // A handler still holding a RUNNING copy after the worker already reported.
        if job.status == JobStatus::Running && stored.status != JobStatus::Running {
            return Err(JobStoreError::StaleClaim(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn claim_next(
        &self,
        now: DateTime<Utc>,
        visibility: Duration,
        filter: ClaimFilter,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(lock_err)?;
        let allow_retrain = filter.allow_retrain && !retrain_in_flight(&jobs, now);

        let next = jobs
            .values()
            .filter(|j| j.is_ready(now) && (allow_retrain || j.kind != JobKind::Retrain))
            .min_by_key(|j| (j.not_before, j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.mark_running(now, visibility);
            Some(job.clone())
        }))
    }

    fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(lock_err)?;
        let mut reaped = Vec::new();
        for job in jobs.values_mut() {
            let lapsed = job.status == JobStatus::Running
                && job.lease_expires_at.is_some_and(|exp| exp <= now);
            if !lapsed {
                continue;
            }
            let started = job.updated_at;
            job.mark_failed(
                &PipelineError::store("visibility timeout elapsed before the job reported back"),
                started,
                now,
            );
            reaped.push(job.clone());
        }
        Ok(reaped)
    }

    fn list_by_status(
        &self,
        status: Option<JobStatusFilter>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(lock_err)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| s.matches(&j.status)))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn list_by_kind(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(lock_err)?;
        let mut result: Vec<_> = jobs.values().filter(|j| j.kind == kind).cloned().collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(lock_err)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(&job.status);
        }
        Ok(stats)
    }
}

impl JobStore for Arc<InMemoryJobStore> {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(
        &self,
        now: DateTime<Utc>,
        visibility: Duration,
        filter: ClaimFilter,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now, visibility, filter)
    }

    fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).reap_expired(now)
    }

    fn list_by_status(
        &self,
        status: Option<JobStatusFilter>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn list_by_kind(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_kind(kind, limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}
