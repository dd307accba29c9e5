//! Process-wide settings.
//!
//! Settings are read from environment variables at startup. Only the
//! [`ThresholdConfig`] part is hot-reloadable, through [`SharedThresholds`].

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Alerting thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Composite risk score at or above which a general alert fires. In [0, 1].
    pub alert_threshold: f64,
    /// Stock at or below which a low-stock alert fires.
    pub low_stock_threshold: i64,
    /// Rush score at or above which a rush alert fires. In [0, 1].
    pub rush_prediction_threshold: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            alert_threshold: 0.7,
            low_stock_threshold: 10,
            rush_prediction_threshold: 0.8,
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        unit_interval("ALERT_THRESHOLD", self.alert_threshold)?;
        unit_interval("RUSH_PREDICTION_THRESHOLD", self.rush_prediction_threshold)?;
        if self.low_stock_threshold < 0 {
            return Err(ConfigError::invalid("LOW_STOCK_THRESHOLD", "must be >= 0"));
        }
        Ok(())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let cfg = Self {
            alert_threshold: parse(lookup, "ALERT_THRESHOLD", defaults.alert_threshold)?,
            low_stock_threshold: parse(lookup, "LOW_STOCK_THRESHOLD", defaults.low_stock_threshold)?,
            rush_prediction_threshold: parse(
                lookup,
                "RUSH_PREDICTION_THRESHOLD",
                defaults.rush_prediction_threshold,
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

fn unit_interval(key: &'static str, v: f64) -> Result<(), ConfigError> {
    if !(v.is_finite() && (0.0..=1.0).contains(&v)) {
        return Err(ConfigError::invalid(key, "must be between 0 and 1"));
    }
    Ok(())
}

/// Hot-reloadable threshold holder.
///
/// Readers take a snapshot once per evaluation cycle; a `replace` never changes
/// a snapshot already handed out, so in-flight jobs keep the values they started with.
#[derive(Debug, Clone)]
pub struct SharedThresholds {
    inner: Arc<RwLock<Arc<ThresholdConfig>>>,
}

impl SharedThresholds {
    pub fn new(cfg: ThresholdConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(cfg))),
        }
    }

    pub fn snapshot(&self) -> Arc<ThresholdConfig> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, cfg: ThresholdConfig) -> Result<(), ConfigError> {
        cfg.validate()?;
        let mut guard = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::info!(
            alert_threshold = cfg.alert_threshold,
            low_stock_threshold = cfg.low_stock_threshold,
            rush_prediction_threshold = cfg.rush_prediction_threshold,
            "thresholds replaced"
        );
        *guard = Arc::new(cfg);
        Ok(())
    }

    /// Re-read thresholds from the process environment.
    pub fn reload_from_env(&self) -> Result<Arc<ThresholdConfig>, ConfigError> {
        let cfg = ThresholdConfig::from_lookup(&|k| std::env::var(k).ok())?;
        self.replace(cfg)?;
        Ok(self.snapshot())
    }
}

/// Log output format.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Job cadences.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalSettings {
    /// RETRAIN cadence.
    pub ml_update_interval: Duration,
    /// Forward window for predictions, in hours.
    pub prediction_horizon_hours: u32,
    /// CLEANUP (alert expiry) cadence.
    pub cleanup_interval: Duration,
}

impl Default for IntervalSettings {
    fn default() -> Self {
        Self {
            ml_update_interval: Duration::from_secs(3600),
            prediction_horizon_hours: 24,
            cleanup_interval: Duration::from_secs(1800),
        }
    }
}

impl IntervalSettings {
    pub fn horizon(&self) -> Duration {
        Duration::from_secs(u64::from(self.prediction_horizon_hours) * 3600)
    }

    /// PREDICT cadence: one twenty-fourth of the horizon, never below a minute.
    pub fn predict_interval(&self) -> Duration {
        (self.horizon() / 24).max(Duration::from_secs(60))
    }

    pub fn evaluate_interval(&self) -> Duration {
        self.predict_interval()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    /// Attempts allowed before a job is abandoned.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Backoff multiplier applied when no model is published yet.
    pub cold_start_multiplier: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            cold_start_multiplier: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub pool_size: usize,
    pub job_timeout: Duration,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    /// Number of item partitions for PREDICT/EVALUATE jobs.
    pub item_partitions: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_size: 4,
            job_timeout: Duration::from_secs(25 * 60),
            visibility_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_millis(100),
            item_partitions: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionSettings {
    pub model_retention: usize,
    pub alert_ttl: Duration,
    /// Width of the alert dedup time bucket.
    pub dedup_window: Duration,
    pub training_window: Duration,
    pub inference_window: Duration,
    /// Distinct sales hours a snapshot needs before it is usable.
    pub min_history_hours: usize,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            model_retention: 5,
            alert_ttl: Duration::from_secs(24 * 3600),
            dedup_window: Duration::from_secs(24 * 3600),
            training_window: Duration::from_secs(90 * 24 * 3600),
            inference_window: Duration::from_secs(7 * 24 * 3600),
            min_history_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub lease_ttl: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

/// All process settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub thresholds: ThresholdConfig,
    pub intervals: IntervalSettings,
    pub retry: RetrySettings,
    pub workers: WorkerSettings,
    pub retention: RetentionSettings,
    pub scheduler: SchedulerSettings,
    pub bind_addr: String,
    pub state_dir: PathBuf,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            thresholds: ThresholdConfig::default(),
            intervals: IntervalSettings::default(),
            retry: RetrySettings::default(),
            workers: WorkerSettings::default(),
            retention: RetentionSettings::default(),
            scheduler: SchedulerSettings::default(),
            bind_addr: "0.0.0.0:8080".to_string(),
            state_dir: PathBuf::from("./var"),
            database_url: None,
            redis_url: None,
            log_format: LogFormat::Json,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();

        let intervals = IntervalSettings {
            ml_update_interval: secs(lookup, "ML_UPDATE_INTERVAL", d.intervals.ml_update_interval)?,
            prediction_horizon_hours: parse(
                lookup,
                "PREDICTION_HORIZON",
                d.intervals.prediction_horizon_hours,
            )?,
            cleanup_interval: secs(lookup, "CLEANUP_INTERVAL", d.intervals.cleanup_interval)?,
        };
        if intervals.prediction_horizon_hours == 0 {
            return Err(ConfigError::invalid("PREDICTION_HORIZON", "must be >= 1 hour"));
        }
        if intervals.ml_update_interval.is_zero() || intervals.cleanup_interval.is_zero() {
            return Err(ConfigError::invalid("ML_UPDATE_INTERVAL", "intervals must be non-zero"));
        }

        let retry = RetrySettings {
            max_retries: parse(lookup, "MAX_RETRIES", d.retry.max_retries)?,
            base_delay: millis(lookup, "RETRY_BASE_DELAY_MS", d.retry.base_delay)?,
            max_delay: millis(lookup, "RETRY_MAX_DELAY_MS", d.retry.max_delay)?,
            cold_start_multiplier: parse(
                lookup,
                "COLD_START_BACKOFF_MULTIPLIER",
                d.retry.cold_start_multiplier,
            )?,
        };
        if retry.max_retries == 0 {
            return Err(ConfigError::invalid("MAX_RETRIES", "must be >= 1"));
        }

        let workers = WorkerSettings {
            pool_size: parse(lookup, "WORKER_POOL_SIZE", d.workers.pool_size)?,
            job_timeout: secs(lookup, "JOB_TIMEOUT_SECS", d.workers.job_timeout)?,
            visibility_timeout: secs(lookup, "VISIBILITY_TIMEOUT_SECS", d.workers.visibility_timeout)?,
            poll_interval: d.workers.poll_interval,
            item_partitions: parse(lookup, "ITEM_PARTITIONS", d.workers.item_partitions)?,
        };
        if workers.pool_size == 0 {
            return Err(ConfigError::invalid("WORKER_POOL_SIZE", "must be >= 1"));
        }
        if workers.item_partitions == 0 {
            return Err(ConfigError::invalid("ITEM_PARTITIONS", "must be >= 1"));
        }

        let retention = RetentionSettings {
            model_retention: parse(lookup, "MODEL_RETENTION", d.retention.model_retention)?,
            alert_ttl: hours(lookup, "ALERT_TTL_HOURS", d.retention.alert_ttl)?,
            dedup_window: secs(lookup, "DEDUP_WINDOW_SECS", intervals.horizon())?,
            training_window: days(lookup, "TRAINING_WINDOW_DAYS", d.retention.training_window)?,
            inference_window: hours(lookup, "INFERENCE_WINDOW_HOURS", d.retention.inference_window)?,
            min_history_hours: parse(lookup, "MIN_HISTORY_HOURS", d.retention.min_history_hours)?,
        };
        if retention.model_retention == 0 {
            return Err(ConfigError::invalid("MODEL_RETENTION", "must keep at least one version"));
        }
        if retention.dedup_window.is_zero() {
            return Err(ConfigError::invalid("DEDUP_WINDOW_SECS", "must be non-zero"));
        }

        let scheduler = SchedulerSettings {
            tick: millis(lookup, "SCHEDULER_TICK_MS", d.scheduler.tick)?,
            lease_ttl: secs(lookup, "SCHEDULER_LEASE_SECS", d.scheduler.lease_ttl)?,
        };

        let log_format = match lookup("LOG_FORMAT") {
            Some(v) => v
                .parse::<LogFormat>()
                .map_err(|e| ConfigError::invalid("LOG_FORMAT", e))?,
            None => d.log_format,
        };

        Ok(Self {
            thresholds: ThresholdConfig::from_lookup(lookup)?,
            intervals,
            retry,
            workers,
            retention,
            scheduler,
            bind_addr: lookup("BIND_ADDR").unwrap_or(d.bind_addr),
            state_dir: lookup("STATE_DIR").map(PathBuf::from).unwrap_or(d.state_dir),
            database_url: lookup("DATABASE_URL").filter(|v| !v.is_empty()),
            redis_url: lookup("REDIS_URL").filter(|v| !v.is_empty()),
            log_format,
        })
    }
}

fn parse<T>(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(key, e.to_string())),
        None => Ok(default),
    }
}

fn scaled(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
    unit_secs: u64,
) -> Result<Duration, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|n| Duration::from_secs(n.saturating_mul(unit_secs)))
            .map_err(|e| ConfigError::invalid(key, e.to_string())),
        None => Ok(default),
    }
}

fn secs(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    scaled(lookup, key, default, 1)
}

fn hours(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    scaled(lookup, key, default, 3600)
}

fn days(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    scaled(lookup, key, default, 24 * 3600)
}

fn millis(lookup: &dyn Fn(&str) -> Option<String>, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::invalid(key, e.to_string())),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_applied_when_unset() {
        let s = Settings::from_lookup(&lookup_from(&[])).unwrap();
        assert_eq!(s.thresholds, ThresholdConfig::default());
        assert_eq!(s.intervals.ml_update_interval, Duration::from_secs(3600));
        assert_eq!(s.intervals.predict_interval(), Duration::from_secs(3600));
        assert_eq!(s.retry.max_retries, 3);
        assert_eq!(s.retention.dedup_window, Duration::from_secs(24 * 3600));
        assert_eq!(s.log_format, LogFormat::Json);
    }

    #[test]
    fn env_overrides_are_applied() {
        let s = Settings::from_lookup(&lookup_from(&[
            ("RUSH_PREDICTION_THRESHOLD", "0.9"),
            ("PREDICTION_HORIZON", "48"),
            ("ITEM_PARTITIONS", "4"),
            ("LOG_FORMAT", "pretty"),
            ("DATABASE_URL", ""),
        ]))
        .unwrap();
        assert_eq!(s.thresholds.rush_prediction_threshold, 0.9);
        assert_eq!(s.intervals.predict_interval(), Duration::from_secs(2 * 3600));
        assert_eq!(s.retention.dedup_window, Duration::from_secs(48 * 3600));
        assert_eq!(s.workers.item_partitions, 4);
        assert_eq!(s.log_format, LogFormat::Pretty);
        assert!(s.database_url.is_none());
    }

    #[test]
    fn alert_threshold_must_be_unit_interval() {
        let err = Settings::from_lookup(&lookup_from(&[("ALERT_THRESHOLD", "1.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ALERT_THRESHOLD", .. }));

        let err = Settings::from_lookup(&lookup_from(&[("LOW_STOCK_THRESHOLD", "ten")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LOW_STOCK_THRESHOLD", .. }));
    }

    #[test]
    fn shared_thresholds_snapshots_are_stable() {
        let shared = SharedThresholds::new(ThresholdConfig::default());
        let before = shared.snapshot();

        shared
            .replace(ThresholdConfig {
                rush_prediction_threshold: 0.5,
                ..ThresholdConfig::default()
            })
            .unwrap();

        assert_eq!(before.rush_prediction_threshold, 0.8);
        assert_eq!(shared.snapshot().rush_prediction_threshold, 0.5);
    }

    #[test]
    fn invalid_replacement_is_rejected() {
        let shared = SharedThresholds::new(ThresholdConfig::default());
        let err = shared.replace(ThresholdConfig {
            alert_threshold: -0.1,
            ..ThresholdConfig::default()
        });
        assert!(err.is_err());
        assert_eq!(shared.snapshot().alert_threshold, 0.7);
    }
}
