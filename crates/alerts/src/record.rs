use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shoptrack_core::{AlertId, ItemId, JobId, PipelineError};

/// Alert severity. Ordering is meaningful: `Low < Medium < High < Critical`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Severity {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(PipelineError::invalid_input(format!("unknown severity '{other}'"))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Rush,
    LowStock,
    General,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Rush => "rush",
            AlertKind::LowStock => "low_stock",
            AlertKind::General => "general",
        }
    }
}

impl FromStr for AlertKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rush" => Ok(AlertKind::Rush),
            "low_stock" => Ok(AlertKind::LowStock),
            "general" => Ok(AlertKind::General),
            other => Err(PipelineError::invalid_input(format!("unknown alert kind '{other}'"))),
        }
    }
}

/// Fixed-width time bucket: `floor(unix_seconds / width)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeBucket(pub i64);

impl TimeBucket {
    pub fn of(at: DateTime<Utc>, width: Duration) -> Self {
        let width = width.as_secs().max(1) as i64;
        Self(at.timestamp().div_euclid(width))
    }
}

/// Identity used to collapse repeated triggers into one open record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub item_id: ItemId,
    pub kind: AlertKind,
    pub bucket: TimeBucket,
}

impl DedupKey {
    pub fn new(item_id: ItemId, kind: AlertKind, bucket: TimeBucket) -> Self {
        Self {
            item_id,
            kind,
            bucket,
        }
    }
}

impl core::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}:{}", self.item_id, self.kind.as_str(), self.bucket.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Expired,
    Resolved,
    Dismissed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "ACTIVE",
            AlertStatus::Acknowledged => "ACKNOWLEDGED",
            AlertStatus::Expired => "EXPIRED",
            AlertStatus::Resolved => "RESOLVED",
            AlertStatus::Dismissed => "DISMISSED",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(AlertStatus::Active),
            "ACKNOWLEDGED" => Ok(AlertStatus::Acknowledged),
            "EXPIRED" => Ok(AlertStatus::Expired),
            "RESOLVED" => Ok(AlertStatus::Resolved),
            "DISMISSED" => Ok(AlertStatus::Dismissed),
            other => Err(PipelineError::invalid_input(format!("unknown alert status '{other}'"))),
        }
    }
}

/// How an operator closed an alert.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// The underlying condition was handled.
    Resolved,
    /// Not actionable.
    Dismissed,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        self.status().as_str()
    }

    pub fn status(&self) -> AlertStatus {
        match self {
            Resolution::Resolved => AlertStatus::Resolved,
            Resolution::Dismissed => AlertStatus::Dismissed,
        }
    }
}

impl FromStr for Resolution {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RESOLVED" => Ok(Resolution::Resolved),
            "DISMISSED" => Ok(Resolution::Dismissed),
            other => Err(PipelineError::invalid_input(format!("unknown resolution '{other}'"))),
        }
    }
}

/// A trigger decided by the evaluator, not yet reconciled against stored alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCandidate {
    pub dedup_key: DedupKey,
    pub severity: Severity,
    pub observed_at: DateTime<Utc>,
    pub message: String,
    pub score: Option<f64>,
    pub stock: Option<i64>,
}

/// A business alert about one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: AlertId,
    pub dedup_key: DedupKey,
    pub item_id: ItemId,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub score: Option<f64>,
    pub stock: Option<i64>,
    pub first_triggered_at: DateTime<Utc>,
    pub triggered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub expired: bool,
    pub resolution: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl AlertRecord {
    pub fn open(candidate: AlertCandidate, ttl: chrono::Duration) -> Self {
        let key = candidate.dedup_key;
        Self {
            id: AlertId::new(),
            item_id: key.item_id.clone(),
            kind: key.kind,
            dedup_key: key,
            severity: candidate.severity,
            message: candidate.message,
            score: candidate.score,
            stock: candidate.stock,
            first_triggered_at: candidate.observed_at,
            triggered_at: candidate.observed_at,
            expires_at: candidate.observed_at + ttl,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            expired: false,
            resolution: None,
            resolved_at: None,
            resolved_by: None,
        }
    }

    /// Fold a repeat trigger into this record.
    ///
    /// Severity never decreases and `triggered_at` never moves backwards.
    /// Returns the previous severity when the trigger escalated the record.
    pub fn absorb(&mut self, candidate: AlertCandidate, ttl: chrono::Duration) -> Option<Severity> {
        let previous = self.severity;
        if candidate.observed_at >= self.triggered_at {
            self.triggered_at = candidate.observed_at;
            self.expires_at = candidate.observed_at + ttl;
            self.message = candidate.message;
            self.score = candidate.score;
            self.stock = candidate.stock;
        }
        self.severity = self.severity.max(candidate.severity);
        (self.severity > previous).then_some(previous)
    }

    /// An operator closure outranks acknowledgement, which outranks expiry.
    pub fn status(&self) -> AlertStatus {
        if let Some(resolution) = self.resolution {
            resolution.status()
        } else if self.acknowledged {
            AlertStatus::Acknowledged
        } else if self.expired {
            AlertStatus::Expired
        } else {
            AlertStatus::Active
        }
    }

    /// Open records are the ones that hold their dedup key.
    pub fn is_open(&self) -> bool {
        self.status() == AlertStatus::Active
    }
}

/// Result of reconciling a candidate with the stored alerts.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(AlertRecord),
    Updated(AlertRecord),
    Escalated { record: AlertRecord, from: Severity },
}

impl UpsertOutcome {
    pub fn record(&self) -> &AlertRecord {
        match self {
            UpsertOutcome::Created(r) | UpsertOutcome::Updated(r) => r,
            UpsertOutcome::Escalated { record, .. } => record,
        }
    }

    /// Whether collaborators should be notified (new or escalated alert).
    pub fn should_notify(&self) -> bool {
        !matches!(self, UpsertOutcome::Updated(_))
    }
}

/// Pipeline-health alert (abandoned jobs, invariant violations).
///
/// Kept apart from business `AlertRecord`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationalAlert {
    pub id: AlertId,
    pub severity: Severity,
    pub source: String,
    pub job_id: Option<JobId>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl OperationalAlert {
    pub fn new(
        severity: Severity,
        source: impl Into<String>,
        job_id: Option<JobId>,
        message: impl Into<String>,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            severity,
            source: source.into(),
            job_id,
            message: message.into(),
            raised_at,
        }
    }
}
