use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;

use shoptrack_ai::{DataSource, RollingBaselineForecaster};
use shoptrack_core::{Clock, PipelineError, PipelineResult, Settings, SharedThresholds, SystemClock};
use shoptrack_infra::jobs::{ExecutorStats, InMemoryJobStore, JobStore, RetryPolicy, WorkerPool, WorkerPoolHandle};
use shoptrack_infra::scheduler::{
    default_schedule, InMemoryLease, JsonFileStateStore, SchedulerHandle, SchedulerLease, TaskScheduler,
};
use shoptrack_infra::{
    FsModelStore, InMemoryDataSource, InMemoryResultSink, ModelStore, PgContext, Pipeline,
    PostgresDataSource, PostgresResultSink, ResultSink,
};

/// Where sales history and stock levels come from.
#[derive(Clone)]
pub enum DataBackend {
    /// Fed through the ingest endpoints.
    InMemory(Arc<InMemoryDataSource>),
    /// Read-only view over the shop database.
    Postgres(Arc<PostgresDataSource>),
}

impl DataBackend {
    pub fn source(&self) -> Arc<dyn DataSource> {
        match self {
            DataBackend::InMemory(d) => d.clone(),
            DataBackend::Postgres(d) => d.clone(),
        }
    }

    /// `None` when the backend does not accept writes.
    pub fn ingest(&self) -> Option<&Arc<InMemoryDataSource>> {
        match self {
            DataBackend::InMemory(d) => Some(d),
            DataBackend::Postgres(_) => None,
        }
    }
}

struct Background {
    scheduler: SchedulerHandle,
    workers: WorkerPoolHandle,
}

/// Everything the HTTP handlers talk to.
pub struct AppServices {
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
    pub jobs: Arc<dyn JobStore>,
    pub models: Arc<dyn ModelStore>,
    pub sink: Arc<dyn ResultSink>,
    pub data: DataBackend,
    pub thresholds: SharedThresholds,
    pub scheduler: Arc<TaskScheduler>,
    background: Mutex<Option<Background>>,
}

impl AppServices {
    /// The scheduler counts as alive if it ticked within a few tick periods.
    pub fn scheduler_alive(&self) -> bool {
        let grace = (self.settings.scheduler.tick * 5).max(Duration::from_secs(5));
        self.scheduler.health().is_alive(self.clock.now(), grace)
    }

    pub fn worker_stats(&self) -> Option<ExecutorStats> {
        let guard = match self.background.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().map(|b| b.workers.stats())
    }

    /// Stop the scheduler, then drain the workers. Blocks until both are joined.
    pub fn shutdown(&self) {
        let background = match self.background.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(bg) = background {
            bg.scheduler.shutdown();
            bg.workers.shutdown();
            tracing::info!("pipeline stopped");
        }
    }
}

/// Run a synchronous store call off the async runtime.
///
/// Postgres-backed stores `block_on` internally, which must not happen on a
/// runtime worker thread.
pub async fn run_blocking<F, T>(f: F) -> PipelineResult<T>
where
    F: FnOnce() -> PipelineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::invariant(format!("blocking task failed: {e}")))?
}

fn lease_for(settings: &Settings) -> anyhow::Result<Arc<dyn SchedulerLease>> {
    #[cfg(feature = "redis")]
    if let Some(url) = settings.redis_url.as_deref() {
        let lease = shoptrack_infra::scheduler::RedisLease::new(url, None)
            .context("failed to create redis fire lease")?;
        tracing::info!("using redis fire lease");
        return Ok(Arc::new(lease));
    }

    #[cfg(not(feature = "redis"))]
    if settings.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but the redis feature is disabled; using a process-local lease");
    }

    Ok(Arc::new(InMemoryLease::new()))
}

/// Wire stores, pipeline, worker pool and scheduler, and start the background threads.
///
/// Postgres is used for data and results when `DATABASE_URL` is set; otherwise
/// everything except model artifacts and scheduler state lives in memory.
pub async fn build_services(settings: Settings) -> anyhow::Result<Arc<AppServices>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (data, sink): (DataBackend, Arc<dyn ResultSink>) = match settings.database_url.as_deref() {
        Some(url) => {
            let max_connections = settings.workers.pool_size as u32 + 4;
            let pg = PgContext::connect(url, max_connections)
                .await
                .context("failed to connect to Postgres")?;
            let sink = PostgresResultSink::new(pg.clone(), settings.retention.alert_ttl);
            sink.migrate().await.context("failed to migrate result tables")?;
            tracing::info!("using postgres data source and result sink");
            (DataBackend::Postgres(Arc::new(PostgresDataSource::new(pg))), Arc::new(sink))
        }
        None => {
            tracing::info!("DATABASE_URL not set; using in-memory data source and result sink");
            (
                DataBackend::InMemory(Arc::new(InMemoryDataSource::new())),
                Arc::new(InMemoryResultSink::new(settings.retention.alert_ttl)),
            )
        }
    };

    let models: Arc<dyn ModelStore> = Arc::new(
        FsModelStore::open(&settings.state_dir, settings.retention.model_retention)
            .with_context(|| format!("failed to open model store in {}", settings.state_dir.display()))?,
    );
    let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let thresholds = SharedThresholds::new(settings.thresholds.clone());

    let pipeline = Arc::new(Pipeline::new(
        data.source(),
        models.clone(),
        sink.clone(),
        Arc::new(RollingBaselineForecaster::new(settings.retention.min_history_hours)),
        thresholds.clone(),
        clock.clone(),
        &settings,
    ));
    let mut pool = WorkerPool::new(jobs.clone(), sink.clone(), clock.clone(), settings.workers.clone());
    pipeline.register(&mut pool);
    let workers = pool.spawn().context("failed to spawn worker pool")?;

    let scheduler = Arc::new(
        TaskScheduler::new(
            jobs.clone(),
            lease_for(&settings)?,
            Arc::new(JsonFileStateStore::new(settings.state_dir.join("scheduler.json"))),
            clock.clone(),
            settings.scheduler.clone(),
        )
        .with_schedule(default_schedule(&settings.intervals))
        .with_partitions(settings.workers.item_partitions)
        .with_retry_policy(RetryPolicy::from_settings(&settings.retry))
        .with_volatile_queue(),
    );
    let scheduler_handle = scheduler.clone().spawn().context("failed to spawn scheduler")?;

    tracing::info!(
        workers = settings.workers.pool_size,
        partitions = settings.workers.item_partitions,
        "pipeline started"
    );

    Ok(Arc::new(AppServices {
        settings,
        clock,
        jobs,
        models,
        sink,
        data,
        thresholds,
        scheduler,
        background: Mutex::new(Some(Background {
            scheduler: scheduler_handle,
            workers,
        })),
    }))
}
