//! Worker pool: claims jobs, runs handlers under a timeout, applies retry policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use shoptrack_alerts::{OperationalAlert, Severity};
use shoptrack_core::config::WorkerSettings;
use shoptrack_core::{Clock, ErrorClass, PipelineError};

use crate::sink::ResultSink;

use super::store::{ClaimFilter, JobStore, JobStoreError};
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Job handler function type.
///
/// The handler gets a mutable copy of the claimed job and the queue, so it can
/// persist payload changes (such as a pinned model version) before side effects.
pub type JobHandler = Arc<dyn Fn(&mut Job, &dyn JobStore) -> JobResult + Send + Sync>;

/// Called after a job fails with a logic invariant violation.
pub type InvariantHook = Arc<dyn Fn(&Job, &PipelineError) + Send + Sync>;

const SOURCE: &str = "worker-pool";

/// Process-local RETRAIN permit. At most one RETRAIN handler runs at a time.
#[derive(Debug, Default)]
pub struct RetrainGate {
    busy: AtomicBool,
}

/// Held for the whole RETRAIN handler run; released on drop.
#[derive(Debug)]
pub struct RetrainPermit(Arc<RetrainGate>);

impl RetrainGate {
    pub fn try_acquire(self: &Arc<Self>) -> Option<RetrainPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RetrainPermit(self.clone()))
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for RetrainPermit {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Failed attempts that were scheduled for retry.
    pub jobs_failed: u64,
    pub jobs_abandoned: u64,
    pub jobs_superseded: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control running workers.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    workers: Vec<(mpsc::Sender<()>, thread::JoinHandle<()>)>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for in-flight jobs.
    pub fn shutdown(self) {
        for (tx, _) in &self.workers {
            let _ = tx.send(());
        }
        for (_, join) in self.workers {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = match self.stats.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Pool of workers sharing one queue.
///
/// Delivery is at-least-once: a worker that dies mid-job leaves the claim to lapse,
/// and the job is re-delivered by `reap_expired`. Handlers are idempotent.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn ResultSink>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
    handlers: HashMap<JobKind, JobHandler>,
    invariant_hooks: Vec<InvariantHook>,
    retrain_gate: Arc<RetrainGate>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        sink: Arc<dyn ResultSink>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            sink,
            clock,
            settings,
            handlers: HashMap::new(),
            invariant_hooks: Vec::new(),
            retrain_gate: Arc::new(RetrainGate::default()),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    /// Register the handler for a job kind.
    pub fn register<F>(&mut self, kind: JobKind, handler: F)
    where
        F: Fn(&mut Job, &dyn JobStore) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
    }

    /// Run `hook` whenever a job fails with a logic invariant violation.
    pub fn on_invariant_violation<F>(&mut self, hook: F)
    where
        F: Fn(&Job, &PipelineError) + Send + Sync + 'static,
    {
        self.invariant_hooks.push(Arc::new(hook));
    }

    pub fn stats(&self) -> ExecutorStats {
        match self.stats.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, f: impl FnOnce(&mut ExecutorStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    /// Claim and run at most one job. Returns the job's final state, if one was claimed.
    pub fn poll_once(&self) -> Result<Option<Job>, JobStoreError> {
        let filter = ClaimFilter {
            allow_retrain: !self.retrain_gate.is_busy(),
        };
        let now = self.clock.now();
        let Some(job) = self
            .store
            .claim_next(now, self.settings.visibility_timeout, filter)?
        else {
            return Ok(None);
        };
        debug!(job_id = %job.id, kind = ?job.kind, attempt = job.attempt, "claimed job");

        if job.kind != JobKind::Retrain {
            return Ok(Some(self.execute(job, None)));
        }
        match self.retrain_gate.try_acquire() {
            Some(permit) => Ok(Some(self.execute(job, Some(permit)))),
            None => {
                // A timed-out RETRAIN handler still holds the permit.
                let busy = PipelineError::store("another RETRAIN handler is still running");
                Ok(Some(self.finish(job, JobResult::Failed(busy), now)))
            }
        }
    }

    /// Release lapsed claims and report jobs that ran out of attempts.
    pub fn reap(&self) -> Result<usize, JobStoreError> {
        let reaped = self.store.reap_expired(self.clock.now())?;
        for job in &reaped {
            warn!(job_id = %job.id, kind = ?job.kind, status = job.status.name(), "claim lapsed");
            if let JobStatus::Abandoned { reason, attempts } = &job.status {
                self.record(|s| s.jobs_abandoned += 1);
                self.raise(
                    Severity::High,
                    job,
                    format!("{} job abandoned after {attempts} attempts: {reason}", job.kind.as_str()),
                );
            }
        }
        Ok(reaped.len())
    }

    /// Run a claimed job to its next state and write it back.
    pub fn execute(&self, mut job: Job, permit: Option<RetrainPermit>) -> Job {
        let started = self.clock.now();

        if job.is_superseded(started) {
            job.mark_abandoned("superseded by a newer scheduled slot", started);
            info!(job_id = %job.id, kind = ?job.kind, "retry superseded");
            self.write_back(&job);
            self.record(|s| {
                s.jobs_processed += 1;
                s.jobs_superseded += 1;
            });
            self.raise(
                Severity::Low,
                &job,
                format!("stale {} retry superseded by a newer slot", job.kind.as_str()),
            );
            return job;
        }

        self.record(|s| s.current_running += 1);
        let result = match self.handlers.get(&job.kind) {
            Some(handler) => self.run_with_timeout(handler.clone(), &mut job, permit),
            None => JobResult::Failed(PipelineError::invariant(format!(
                "no handler registered for {}",
                job.kind.as_str()
            ))),
        };
        self.record(|s| s.current_running = s.current_running.saturating_sub(1));
        self.finish(job, result, started)
    }

    /// Apply a handler result: status transition, write-back, stats and alerts.
    fn finish(&self, mut job: Job, result: JobResult, started: DateTime<Utc>) -> Job {
        let finished = self.clock.now();

        let failure = match result {
            JobResult::Success => {
                job.mark_succeeded(None, started, finished);
                None
            }
            JobResult::SuccessWithWarning(warning) => {
                warn!(job_id = %job.id, kind = ?job.kind, %warning, "job succeeded with warning");
                job.mark_succeeded(Some(warning), started, finished);
                None
            }
            JobResult::Failed(err) => {
                job.mark_failed(&err, started, finished);
                Some(err)
            }
        };

        self.write_back(&job);
        self.record(|s| {
            s.jobs_processed += 1;
            match &job.status {
                JobStatus::Succeeded { .. } => s.jobs_succeeded += 1,
                JobStatus::Failed { .. } => s.jobs_failed += 1,
                JobStatus::Abandoned { .. } => s.jobs_abandoned += 1,
                JobStatus::Pending | JobStatus::Running => {}
            }
        });

        if let Some(err) = failure.as_ref().filter(|e| e.class() == ErrorClass::LogicInvariantViolation) {
            for hook in &self.invariant_hooks {
                hook(&job, err);
            }
        }

        match (&job.status, failure) {
            (JobStatus::Failed { error, attempt }, _) => {
                debug!(job_id = %job.id, kind = ?job.kind, attempt, %error, not_before = %job.not_before, "retry scheduled");
            }
            (JobStatus::Abandoned { reason, attempts }, Some(err)) => {
                let severity = if err.class() == ErrorClass::LogicInvariantViolation {
                    Severity::Critical
                } else {
                    Severity::High
                };
                error!(job_id = %job.id, kind = ?job.kind, attempts, %reason, "job abandoned");
                self.raise(
                    severity,
                    &job,
                    format!("{} job abandoned after {attempts} attempts: {reason}", job.kind.as_str()),
                );
            }
            _ => debug!(job_id = %job.id, kind = ?job.kind, status = job.status.name(), "job finished"),
        }
        job
    }

    /// Run the handler on its own thread and stop waiting after `job_timeout`.
    ///
    /// A timed-out handler thread is left to finish on its own; its late writes are
    /// idempotent and its stale job copy is rejected by the queue.
    fn run_with_timeout(
        &self,
        handler: JobHandler,
        job: &mut Job,
        permit: Option<RetrainPermit>,
    ) -> JobResult {
        let (tx, rx) = mpsc::channel();
        let store = self.store.clone();
        let mut copy = job.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", job.kind.as_str()))
            .spawn(move || {
                let _permit = permit;
                let result = handler(&mut copy, &*store);
                let _ = tx.send((copy, result));
            });
        if let Err(err) = spawned {
            return JobResult::Failed(PipelineError::store(format!(
                "failed to spawn handler thread: {err}"
            )));
        }

        match rx.recv_timeout(self.settings.job_timeout) {
            Ok((updated, result)) => {
                *job = updated;
                result
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(job_id = %job.id, kind = ?job.kind, timeout = ?self.settings.job_timeout, "job timed out");
                // Keep what the handler persisted (e.g. the pinned model version).
                if let Ok(Some(stored)) = self.store.get(job.id) {
                    if stored.attempt == job.attempt {
                        job.payload = stored.payload;
                    }
                }
                JobResult::Failed(PipelineError::Timeout(self.settings.job_timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => JobResult::Failed(PipelineError::invariant(
                format!("{} handler panicked", job.kind.as_str()),
            )),
        }
    }

    fn write_back(&self, job: &Job) {
        match self.store.update(job) {
            Ok(()) => {}
            Err(err @ (JobStoreError::Terminal(_) | JobStoreError::StaleClaim(_))) => {
                warn!(job_id = %job.id, error = %err, "lost claim; result discarded");
            }
            Err(err) => error!(job_id = %job.id, error = %err, "failed to write job state"),
        }
    }

    fn raise(&self, severity: Severity, job: &Job, message: String) {
        let alert = OperationalAlert::new(severity, SOURCE, Some(job.id), message, self.clock.now());
        if let Err(err) = self.sink.raise_operational(alert) {
            error!(job_id = %job.id, error = %err, "failed to raise operational alert");
        }
    }

    /// Spawn `pool_size` worker threads.
    pub fn spawn(self) -> std::io::Result<WorkerPoolHandle> {
        let size = self.settings.pool_size.max(1);
        let poll = self.settings.poll_interval;
        let stats = self.stats.clone();
        let pool = Arc::new(self);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let pool = pool.clone();
            let join = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker_loop(&pool, index, poll, shutdown_rx))?;
            workers.push((shutdown_tx, join));
        }
        info!(workers = size, "worker pool started");

        Ok(WorkerPoolHandle {
            workers,
            stats,
            started: Instant::now(),
        })
    }
}

fn worker_loop(
    pool: &WorkerPool,
    index: usize,
    poll: std::time::Duration,
    shutdown_rx: mpsc::Receiver<()>,
) {
    debug!(worker = index, "worker started");
    loop {
        if let Err(err) = pool.reap() {
            error!(worker = index, error = %err, "failed to reap lapsed claims");
        }

        let idle = match pool.poll_once() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(err) => {
                error!(worker = index, error = %err, "failed to claim job");
                true
            }
        };

        if idle {
            match shutdown_rx.recv_timeout(poll) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        } else {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
                Err(mpsc::TryRecvError::Empty) => {}
            }
        }
    }
    debug!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::sink::InMemoryResultSink;
    use chrono::{DateTime, TimeZone, Utc};
    use shoptrack_ai::Partition;
    use shoptrack_core::ManualClock;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        sink: Arc<InMemoryResultSink>,
        clock: Arc<ManualClock>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        Fixture {
            store: InMemoryJobStore::arc(),
            sink: Arc::new(InMemoryResultSink::new(Duration::from_secs(3600))),
            clock: Arc::new(ManualClock::new(t0())),
        }
    }

    fn pool(f: &Fixture, timeout: Duration) -> WorkerPool {
        WorkerPool::new(
            f.store.clone(),
            f.sink.clone(),
            f.clock.clone(),
            WorkerSettings {
                job_timeout: timeout,
                ..WorkerSettings::default()
            },
        )
    }

    fn enqueue(f: &Fixture, kind: JobKind) -> Job {
        let job = Job::scheduled(kind, t0(), Partition::ALL, t0());
        f.store.enqueue(job.clone()).unwrap();
        job
    }

    #[test]
    fn successful_job_is_marked_succeeded() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_secs(5));
        pool.register(JobKind::Predict, |_, _| JobResult::Success);
        let job = enqueue(&f, JobKind::Predict);

        let done = pool.poll_once().unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Succeeded { warning: None });
        assert_eq!(f.store.get(job.id).unwrap().unwrap().status, done.status);
        assert_eq!(pool.stats().jobs_succeeded, 1);
    }

    #[test]
    fn data_quality_failure_succeeds_with_warning() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_secs(5));
        pool.register(JobKind::Predict, |_, _| {
            JobResult::from(Err::<(), _>(PipelineError::insufficient("3 distinct hours")))
        });
        enqueue(&f, JobKind::Predict);

        let done = pool.poll_once().unwrap().unwrap();
        assert!(matches!(done.status, JobStatus::Succeeded { warning: Some(_) }));
        assert!(f.sink.list_operational(10).unwrap().is_empty());
    }

    #[test]
    fn transient_failures_retry_then_abandon_with_one_alert() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_secs(5));
        pool.register(JobKind::Retrain, |_, _| {
            JobResult::Failed(PipelineError::store("connection refused"))
        });
        let job = enqueue(&f, JobKind::Retrain);

        let first = pool.poll_once().unwrap().unwrap();
        assert!(matches!(first.status, JobStatus::Failed { attempt: 1, .. }));
        // Backoff: not claimable until not_before.
        assert!(pool.poll_once().unwrap().is_none());

        f.clock.advance(chrono::Duration::minutes(5));
        let second = pool.poll_once().unwrap().unwrap();
        assert!(matches!(second.status, JobStatus::Failed { attempt: 2, .. }));

        f.clock.advance(chrono::Duration::minutes(5));
        let third = pool.poll_once().unwrap().unwrap();
        assert!(matches!(third.status, JobStatus::Abandoned { attempts: 3, .. }));
        assert_eq!(third.history.len(), 3);

        let ops = f.sink.list_operational(10).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].severity, Severity::High);
        assert_eq!(ops[0].job_id, Some(job.id));
    }

    #[test]
    fn invariant_violation_abandons_immediately_with_critical_alert() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_secs(5));
        pool.register(JobKind::Evaluate, |_, _| {
            JobResult::Failed(PipelineError::invariant("two current pointers"))
        });
        enqueue(&f, JobKind::Evaluate);

        let done = pool.poll_once().unwrap().unwrap();
        assert!(matches!(done.status, JobStatus::Abandoned { attempts: 1, .. }));
        let ops = f.sink.list_operational(10).unwrap();
        assert_eq!(ops[0].severity, Severity::Critical);
    }

    #[test]
    fn missing_handler_is_an_invariant_violation() {
        let f = fixture();
        let pool = pool(&f, Duration::from_secs(5));
        enqueue(&f, JobKind::Cleanup);

        let done = pool.poll_once().unwrap().unwrap();
        assert!(matches!(done.status, JobStatus::Abandoned { .. }));
    }

    #[test]
    fn slow_handler_times_out_and_is_retried() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_millis(20));
        pool.register(JobKind::Predict, |_, _| {
            thread::sleep(Duration::from_millis(300));
            JobResult::Success
        });
        enqueue(&f, JobKind::Predict);

        let done = pool.poll_once().unwrap().unwrap();
        match done.status {
            JobStatus::Failed { error, attempt } => {
                assert_eq!(attempt, 1);
                assert!(error.contains("timed out"));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn panicking_handler_is_abandoned() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_secs(5));
        pool.register(JobKind::Predict, |_, _| panic!("boom"));
        enqueue(&f, JobKind::Predict);

        let done = pool.poll_once().unwrap().unwrap();
        assert!(matches!(done.status, JobStatus::Abandoned { .. }));
        assert_eq!(f.sink.list_operational(10).unwrap()[0].severity, Severity::Critical);
    }

    #[test]
    fn stale_retry_is_superseded() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_secs(5));
        pool.register(JobKind::Predict, |_, _| {
            JobResult::Failed(PipelineError::store("down"))
        });
        let job = Job::scheduled(JobKind::Predict, t0(), Partition::ALL, t0())
            .superseded_after(Duration::from_secs(3600));
        f.store.enqueue(job).unwrap();

        pool.poll_once().unwrap().unwrap();
        f.clock.advance(chrono::Duration::hours(2));
        let done = pool.poll_once().unwrap().unwrap();
        match done.status {
            JobStatus::Abandoned { reason, .. } => assert!(reason.contains("superseded")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(f.sink.list_operational(10).unwrap()[0].severity, Severity::Low);
        assert_eq!(pool.stats().jobs_superseded, 1);
    }

    #[test]
    fn late_first_attempt_still_runs() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_secs(5));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        pool.register(JobKind::Predict, move |_, _| {
            flag.store(true, Ordering::SeqCst);
            JobResult::Success
        });
        let job = Job::scheduled(JobKind::Predict, t0(), Partition::ALL, t0())
            .superseded_after(Duration::from_secs(3600));
        f.store.enqueue(job).unwrap();

        // Claimed two intervals after its slot, on the first attempt.
        f.clock.advance(chrono::Duration::hours(2));
        let done = pool.poll_once().unwrap().unwrap();
        assert_eq!(done.attempt, 1);
        assert_eq!(done.status, JobStatus::Succeeded { warning: None });
        assert_eq!(done.history.len(), 1);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(pool.stats().jobs_superseded, 0);
    }

    #[test]
    fn invariant_violation_runs_registered_hooks() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_secs(5));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        pool.on_invariant_violation(move |job, err| {
            log.lock().unwrap().push((job.kind, err.to_string()));
        });
        pool.register(JobKind::Predict, |_, _| {
            JobResult::Failed(PipelineError::invariant("pinned model v1 is no longer retained"))
        });
        pool.register(JobKind::Cleanup, |_, _| {
            JobResult::Failed(PipelineError::store("down"))
        });
        enqueue(&f, JobKind::Predict);
        pool.poll_once().unwrap().unwrap();

        let cleanup = Job::scheduled(JobKind::Cleanup, t0(), Partition::ALL, t0());
        f.store.enqueue(cleanup).unwrap();
        pool.poll_once().unwrap().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, JobKind::Predict);
        assert!(seen[0].1.contains("no longer retained"));
    }

    /// Records whether the RETRAIN permit was held while a worker was claiming.
    struct GateWatchingStore {
        inner: Arc<InMemoryJobStore>,
        gate: Mutex<Option<Arc<RetrainGate>>>,
        busy_during_claim: Mutex<Vec<bool>>,
    }

    impl JobStore for GateWatchingStore {
        fn enqueue(&self, job: Job) -> Result<shoptrack_core::JobId, JobStoreError> {
            self.inner.enqueue(job)
        }

        fn get(&self, job_id: shoptrack_core::JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(job_id)
        }

        fn update(&self, job: &Job) -> Result<(), JobStoreError> {
            self.inner.update(job)
        }

        fn claim_next(
            &self,
            now: DateTime<Utc>,
            visibility: Duration,
            filter: ClaimFilter,
        ) -> Result<Option<Job>, JobStoreError> {
            if let Some(gate) = self.gate.lock().unwrap().as_ref() {
                self.busy_during_claim.lock().unwrap().push(gate.is_busy());
            }
            self.inner.claim_next(now, visibility, filter)
        }

        fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
            self.inner.reap_expired(now)
        }

        fn list_by_status(
            &self,
            status: Option<crate::jobs::JobStatusFilter>,
            limit: usize,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_by_status(status, limit)
        }

        fn list_by_kind(&self, kind: JobKind, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_by_kind(kind, limit)
        }

        fn stats(&self) -> Result<crate::jobs::JobStats, JobStoreError> {
            self.inner.stats()
        }
    }

    #[test]
    fn permit_is_taken_only_after_claiming_a_retrain() {
        let f = fixture();
        let store = Arc::new(GateWatchingStore {
            inner: f.store.clone(),
            gate: Mutex::new(None),
            busy_during_claim: Mutex::new(Vec::new()),
        });
        let mut pool = WorkerPool::new(store.clone(), f.sink.clone(), f.clock.clone(), WorkerSettings::default());
        *store.gate.lock().unwrap() = Some(pool.retrain_gate.clone());

        let gate = pool.retrain_gate.clone();
        let held_while_running = Arc::new(AtomicBool::new(false));
        let flag = held_while_running.clone();
        pool.register(JobKind::Retrain, move |_, _| {
            flag.store(gate.is_busy(), Ordering::SeqCst);
            JobResult::Success
        });
        pool.register(JobKind::Predict, |_, _| JobResult::Success);
        enqueue(&f, JobKind::Predict);
        enqueue(&f, JobKind::Retrain);

        pool.poll_once().unwrap().unwrap();
        pool.poll_once().unwrap().unwrap();

        assert_eq!(*store.busy_during_claim.lock().unwrap(), vec![false, false]);
        assert!(held_while_running.load(Ordering::SeqCst));
        assert!(!pool.retrain_gate.is_busy());
    }

    #[test]
    fn retrain_is_not_claimed_while_the_permit_is_held() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_secs(5));
        pool.register(JobKind::Retrain, |_, _| JobResult::Success);
        enqueue(&f, JobKind::Retrain);

        let held = pool.retrain_gate.try_acquire().unwrap();
        assert!(pool.poll_once().unwrap().is_none());
        drop(held);

        let done = pool.poll_once().unwrap().unwrap();
        assert_eq!(done.kind, JobKind::Retrain);
        assert!(!pool.retrain_gate.is_busy());
    }

    #[test]
    fn lapsed_claim_is_redelivered() {
        let f = fixture();
        let mut pool = pool(&f, Duration::from_secs(5));
        pool.register(JobKind::Predict, |_, _| JobResult::Success);
        let job = enqueue(&f, JobKind::Predict);

        // A worker claims and dies.
        f.store
            .claim_next(t0(), Duration::from_secs(60), ClaimFilter::default())
            .unwrap()
            .unwrap();
        assert!(pool.poll_once().unwrap().is_none());

        f.clock.advance(chrono::Duration::minutes(2));
        assert_eq!(pool.reap().unwrap(), 1);
        f.clock.advance(chrono::Duration::minutes(5));
        let done = pool.poll_once().unwrap().unwrap();
        assert_eq!(done.id, job.id);
        assert_eq!(done.attempt, 2);
        assert_eq!(done.status, JobStatus::Succeeded { warning: None });
    }

    #[test]
    fn spawned_pool_drains_queue_and_shuts_down() {
        let f = fixture();
        let mut pool = WorkerPool::new(
            f.store.clone(),
            f.sink.clone(),
            f.clock.clone(),
            WorkerSettings {
                pool_size: 3,
                poll_interval: Duration::from_millis(5),
                ..WorkerSettings::default()
            },
        );
        pool.register(JobKind::Predict, |_, _| JobResult::Success);
        for i in 0..10 {
            let part = Partition::new(i, 10).unwrap();
            f.store
                .enqueue(Job::scheduled(JobKind::Predict, t0(), part, t0()))
                .unwrap();
        }

        let handle = pool.spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_succeeded < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.stats().jobs_succeeded, 10);
        assert_eq!(f.store.stats().unwrap().succeeded, 10);
        handle.shutdown();
    }
}
