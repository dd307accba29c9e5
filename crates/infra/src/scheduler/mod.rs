//! Task Scheduler: fires recurring jobs on fixed intervals.
//!
//! ## Design
//!
//! - Time is cut into slots per kind: `slot = floor(unix_secs / interval_secs)`.
//! - `tick(now)` enqueues each kind at most once per slot. The last-fired slot is
//!   persisted, and scheduled job ids are derived from (kind, slot, partition), so
//!   repeated ticks, restarts and racing instances never double-enqueue.
//! - After downtime the missed slots collapse into one catch-up job for the current slot.
//! - Only the holder of the fire lease enqueues; standby instances tick idly.
//! - A failed enqueue leaves the state untouched, so the next tick retries.
//! - With a queue that does not survive restarts, the first tick after start
//!   re-enqueues the current slot even though the persisted state says it fired.

pub mod lease;
pub mod state;

pub use lease::{InMemoryLease, SchedulerLease};
#[cfg(feature = "redis")]
pub use lease::RedisLease;
pub use state::{InMemoryStateStore, JsonFileStateStore, SchedulerState, SchedulerStateStore};

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, error, info, instrument, warn};

use shoptrack_ai::Partition;
use shoptrack_core::config::{IntervalSettings, SchedulerSettings};
use shoptrack_core::{Clock, JobId, PipelineError, PipelineResult};

use crate::jobs::{Job, JobKind, JobOrigin, JobStore, JobStoreError, RetryPolicy};

/// Cadence of one job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub kind: JobKind,
    pub interval: Duration,
}

impl ScheduleEntry {
    fn interval_secs(&self) -> i64 {
        self.interval.as_secs().max(1) as i64
    }

    pub fn slot_of(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.interval_secs())
    }

    pub fn slot_start(&self, slot: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(slot * self.interval_secs(), 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Standard schedule: RETRAIN on the model interval, PREDICT/EVALUATE on the
/// horizon-derived cadence, CLEANUP on its own interval.
pub fn default_schedule(intervals: &IntervalSettings) -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry { kind: JobKind::Retrain, interval: intervals.ml_update_interval },
        ScheduleEntry { kind: JobKind::Predict, interval: intervals.predict_interval() },
        ScheduleEntry { kind: JobKind::Evaluate, interval: intervals.evaluate_interval() },
        ScheduleEntry { kind: JobKind::Cleanup, interval: intervals.cleanup_interval },
    ]
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub lease_held: bool,
    pub enqueued: Vec<JobId>,
    /// Jobs another tick or instance already enqueued.
    pub duplicates: usize,
    pub catch_up: Vec<JobKind>,
}

/// Liveness shared with the health endpoint.
#[derive(Debug, Default)]
pub struct SchedulerHealth {
    last_tick_millis: AtomicI64,
}

impl SchedulerHealth {
    pub fn beat(&self, now: DateTime<Utc>) {
        self.last_tick_millis.store(now.timestamp_millis(), Ordering::Release);
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        match self.last_tick_millis.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Alive when the loop ticked within `grace`.
    pub fn is_alive(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        self.last_tick().is_some_and(|t| now - t <= grace)
    }
}

pub struct TaskScheduler {
    jobs: Arc<dyn JobStore>,
    lease: Arc<dyn SchedulerLease>,
    state: Arc<dyn SchedulerStateStore>,
    clock: Arc<dyn Clock>,
    holder: String,
    settings: SchedulerSettings,
    schedule: Vec<ScheduleEntry>,
    partitions: u32,
    retry: RetryPolicy,
    health: Arc<SchedulerHealth>,
    refire_current: AtomicBool,
}

impl TaskScheduler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        lease: Arc<dyn SchedulerLease>,
        state: Arc<dyn SchedulerStateStore>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            jobs,
            lease,
            state,
            clock,
            holder: format!("scheduler-{}", JobId::new()),
            settings,
            schedule: default_schedule(&IntervalSettings::default()),
            partitions: 1,
            retry: RetryPolicy::default(),
            health: Arc::new(SchedulerHealth::default()),
            refire_current: AtomicBool::new(false),
        }
    }

    /// The queue is process-local: jobs of the slot in progress died with the
    /// previous process, so the first tick enqueues that slot again.
    pub fn with_volatile_queue(self) -> Self {
        self.refire_current.store(true, Ordering::Release);
        self
    }

    pub fn with_schedule(mut self, schedule: Vec<ScheduleEntry>) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn health(&self) -> Arc<SchedulerHealth> {
        self.health.clone()
    }

    pub fn schedule(&self) -> &[ScheduleEntry] {
        &self.schedule
    }

    fn partitions_for(&self, kind: JobKind) -> Vec<Partition> {
        if !kind.is_partitioned() || self.partitions <= 1 {
            return vec![Partition::ALL];
        }
        (0..self.partitions)
            .map(|index| Partition { index, count: self.partitions })
            .collect()
    }

    /// Enqueue every job due at `now`.
    #[instrument(skip(self), fields(holder = %self.holder), err)]
    pub fn tick(&self, now: DateTime<Utc>) -> PipelineResult<TickReport> {
        self.health.beat(now);
        let mut report = TickReport::default();

        if !self.lease.try_acquire(&self.holder, now, self.settings.lease_ttl)? {
            debug!("fire lease held elsewhere");
            return Ok(report);
        }
        report.lease_held = true;

        let mut state = self.state.load()?;
        let mut changed = false;
        let refire = self.refire_current.swap(false, Ordering::AcqRel);
        let mut failed = false;

        for entry in &self.schedule {
            let slot = entry.slot_of(now);
            let last = state.last_fired.get(&entry.kind).copied();
            let fired = if refire {
                last.is_some_and(|l| l > slot)
            } else {
                last.is_some_and(|l| l >= slot)
            };
            if fired {
                continue;
            }
            if last == Some(slot) {
                info!(kind = ?entry.kind, slot, "re-enqueueing current slot after restart");
            }
            let catch_up = last.is_some_and(|l| slot - l > 1);
            let slot_at = entry.slot_start(slot);

            match self.enqueue_slot(entry, slot_at, catch_up, now, &mut report) {
                Ok(()) => {
                    if catch_up {
                        info!(kind = ?entry.kind, missed = slot - last.unwrap_or(slot) - 1, "missed slots collapsed into one catch-up");
                        report.catch_up.push(entry.kind);
                    }
                    state.last_fired.insert(entry.kind, slot);
                    changed = true;
                }
                Err(err) => {
                    // Leave last_fired alone so the next tick tries again.
                    warn!(kind = ?entry.kind, error = %err, "enqueue failed; retrying next tick");
                    failed = true;
                }
            }
        }
        if refire && failed {
            self.refire_current.store(true, Ordering::Release);
        }

        if changed {
            state.last_tick_at = Some(now);
            self.state.save(&state)?;
        }
        Ok(report)
    }

    fn enqueue_slot(
        &self,
        entry: &ScheduleEntry,
        slot_at: DateTime<Utc>,
        catch_up: bool,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> PipelineResult<()> {
        let origin = if catch_up { JobOrigin::CatchUp } else { JobOrigin::Scheduled };
        for partition in self.partitions_for(entry.kind) {
            let job = Job::scheduled(entry.kind, slot_at, partition, now)
                .with_retry_policy(self.retry.clone())
                .with_origin(origin)
                .superseded_after(entry.interval);
            match self.jobs.enqueue(job) {
                Ok(id) => {
                    debug!(job_id = %id, kind = ?entry.kind, partition = %partition, "job enqueued");
                    report.enqueued.push(id);
                }
                Err(JobStoreError::AlreadyExists(_)) => report.duplicates += 1,
                Err(err) => return Err(PipelineError::from(err)),
            }
        }
        Ok(())
    }

    /// Enqueue an operator-requested RETRAIN.
    ///
    /// It still waits for any running RETRAIN: the queue hands out one at a time.
    pub fn trigger_retrain(&self) -> PipelineResult<JobId> {
        let job = Job::manual(JobKind::Retrain, self.clock.now()).with_retry_policy(self.retry.clone());
        let id = self.jobs.enqueue(job)?;
        info!(job_id = %id, "manual retrain enqueued");
        Ok(id)
    }

    /// Run `tick` every `settings.tick` on a background thread.
    pub fn spawn(self: Arc<Self>) -> std::io::Result<SchedulerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let scheduler = self.clone();
        let join = thread::Builder::new()
            .name("task-scheduler".to_string())
            .spawn(move || scheduler_loop(&scheduler, shutdown_rx))?;
        Ok(SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            health: self.health.clone(),
        })
    }
}

fn scheduler_loop(scheduler: &TaskScheduler, shutdown_rx: mpsc::Receiver<()>) {
    info!(holder = %scheduler.holder, "task scheduler started");
    loop {
        if let Err(err) = scheduler.tick(scheduler.clock.now()) {
            error!(error = %err, "scheduler tick failed");
        }
        match shutdown_rx.recv_timeout(scheduler.settings.tick) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }
    if let Err(err) = scheduler.lease.release(&scheduler.holder) {
        warn!(error = %err, "failed to release fire lease");
    }
    info!("task scheduler stopped");
}

#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    health: Arc<SchedulerHealth>,
}

impl SchedulerHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn health(&self) -> Arc<SchedulerHealth> {
        self.health.clone()
    }
}
