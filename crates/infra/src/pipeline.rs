//! Job handlers: the work behind RETRAIN, PREDICT, EVALUATE and CLEANUP.
//!
//! Every handler is idempotent per job id:
//! - RETRAIN publishes at most one version per job (the store dedups by source job).
//! - PREDICT pins its model version into the job payload before writing anything and
//!   stamps records with the job's `scheduled_at`, so a re-run rewrites identical keys.
//! - EVALUATE derives dedup keys from the job's `scheduled_at`; a re-run only updates.
//! - CLEANUP is a monotone expiry sweep.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use shoptrack_ai::{DataSource, Forecaster, ModelArtifact, PredictionEngine, SnapshotWindow};
use shoptrack_alerts::{channels_for, AlertEvaluator, AlertRecord, NotificationChannel};
use shoptrack_core::config::Settings;
use shoptrack_core::{Clock, PipelineError, PipelineResult, SharedThresholds};

use crate::jobs::{Job, JobKind, JobResult, JobStore, WorkerPool};
use crate::model_store::ModelStore;
use crate::sink::{PredictionQuery, ResultSink};

/// Delivery of new or escalated business alerts.
///
/// Kept apart from the sink: delivery is best effort, persistence is not.
pub trait AlertNotifier: Send + Sync + 'static {
    fn notify(&self, alert: &AlertRecord, channels: &[NotificationChannel]) -> PipelineResult<()>;
}

/// Logs each delivery; the default when no channel integrations are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl AlertNotifier for TracingNotifier {
    fn notify(&self, alert: &AlertRecord, channels: &[NotificationChannel]) -> PipelineResult<()> {
        for channel in channels {
            info!(
                channel = channel.as_str(),
                alert_id = %alert.id,
                item_id = %alert.item_id,
                kind = alert.kind.as_str(),
                severity = alert.severity.as_str(),
                message = %alert.message,
                "alert delivered"
            );
        }
        Ok(())
    }
}

/// In-memory notifier for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    inner: Mutex<Vec<(AlertRecord, Vec<NotificationChannel>)>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<(AlertRecord, Vec<NotificationChannel>)> {
        match self.inner.lock() {
            Ok(v) => v.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AlertNotifier for InMemoryNotifier {
    fn notify(&self, alert: &AlertRecord, channels: &[NotificationChannel]) -> PipelineResult<()> {
        self.inner
            .lock()
            .map_err(shoptrack_core::error::poisoned)?
            .push((alert.clone(), channels.to_vec()));
        Ok(())
    }
}

/// Collaborators shared by all handlers.
pub struct Pipeline {
    data: Arc<dyn DataSource>,
    models: Arc<dyn ModelStore>,
    sink: Arc<dyn ResultSink>,
    engine: PredictionEngine,
    evaluator: AlertEvaluator,
    thresholds: SharedThresholds,
    notifier: Arc<dyn AlertNotifier>,
    clock: Arc<dyn Clock>,
    training_window: Duration,
    inference_window: Duration,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: Arc<dyn DataSource>,
        models: Arc<dyn ModelStore>,
        sink: Arc<dyn ResultSink>,
        forecaster: Arc<dyn Forecaster>,
        thresholds: SharedThresholds,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        Self {
            data,
            models,
            sink,
            engine: PredictionEngine::new(forecaster, settings.intervals.horizon()),
            evaluator: AlertEvaluator::new(settings.retention.dedup_window),
            thresholds,
            notifier: Arc::new(TracingNotifier),
            clock,
            training_window: settings.retention.training_window,
            inference_window: settings.retention.inference_window,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Wire the four handlers into `pool`.
    pub fn register(self: &Arc<Self>, pool: &mut WorkerPool) {
        let p = self.clone();
        pool.register(JobKind::Retrain, move |job, _| JobResult::from(p.retrain(job)));
        let p = self.clone();
        pool.register(JobKind::Predict, move |job, store| JobResult::from(p.predict(job, store)));
        let p = self.clone();
        pool.register(JobKind::Evaluate, move |job, _| JobResult::from(p.evaluate(job)));
        let p = self.clone();
        pool.register(JobKind::Cleanup, move |job, _| JobResult::from(p.cleanup(job)));
        let p = self.clone();
        pool.on_invariant_violation(move |job, err| {
            let reason = format!("{} job {} failed: {err}", job.kind.as_str(), job.id);
            if let Err(halt_err) = p.halt_publishing(&reason) {
                error!(job_id = %job.id, error = %halt_err, "failed to halt model publishing");
            }
        });
    }

    /// Stop RETRAIN from publishing until an operator resumes it. Keeps the first reason.
    pub fn halt_publishing(&self, reason: &str) -> PipelineResult<()> {
        if self.models.halted()?.is_none() {
            warn!(%reason, "halting model publishing");
            self.models.halt(reason.to_string())?;
        }
        Ok(())
    }

    /// Train on the training window ending at the job's slot and publish the result.
    ///
    /// A failure leaves the previous current model in place. Any invariant violation,
    /// here or in another job, halts publishing until an operator resumes it.
    #[instrument(skip_all, fields(job_id = %job.id), err)]
    pub fn retrain(&self, job: &Job) -> PipelineResult<()> {
        let window = SnapshotWindow::ending_at(job.scheduled_at, self.training_window);
        let snapshot = self.data.read_snapshot(window)?;
        snapshot.validate()?;

        let mut trained = self
            .engine
            .forecaster()
            .train(&snapshot, job.scheduled_at)
            .map_err(PipelineError::from)?;
        trained.source_job = Some(job.id);

        match self.models.publish(trained) {
            Ok(artifact) => {
                info!(
                    version = %artifact.version,
                    rows = artifact.metrics.training_rows,
                    items = artifact.metrics.items,
                    "retrain published"
                );
                Ok(())
            }
            Err(err @ PipelineError::InvariantViolation(_)) => {
                self.halt_publishing(&err.to_string())?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Resolve the artifact for a PREDICT job, pinning it on first execution.
    fn pinned_artifact(&self, job: &mut Job, store: &dyn JobStore) -> PipelineResult<Arc<ModelArtifact>> {
        if let Some(version) = job.payload.pinned_model_version {
            return self.models.get(version)?.ok_or_else(|| {
                PipelineError::invariant(format!("pinned model {version} is no longer retained"))
            });
        }

        let artifact = self.models.current()?.ok_or(PipelineError::ModelUnavailable)?;
        job.payload.pinned_model_version = Some(artifact.version);
        // Persist the pin before any record is written.
        store.update(job)?;
        Ok(artifact)
    }

    #[instrument(skip_all, fields(job_id = %job.id, partition = %job.payload.partition), err)]
    pub fn predict(&self, job: &mut Job, store: &dyn JobStore) -> PipelineResult<()> {
        let artifact = self.pinned_artifact(job, store)?;

        let window = SnapshotWindow::ending_at(job.scheduled_at, self.inference_window);
        let snapshot = self.data.read_snapshot(window)?;
        let records = self
            .engine
            .run(&artifact, &snapshot, job.scheduled_at, job.payload.partition)?;

        let written = self.sink.put_predictions(&records)?;
        info!(version = %artifact.version, records = written, "predictions written");
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job.id, partition = %job.payload.partition), err)]
    pub fn evaluate(&self, job: &Job) -> PipelineResult<()> {
        // One thresholds snapshot for the whole cycle.
        let thresholds = self.thresholds.snapshot();
        let predictions = self.sink.latest_predictions(&PredictionQuery::default())?;
        let stock = self.data.read_stock_levels()?;
        let cursors = self.sink.evaluation_cursors()?;

        let evaluation = self.evaluator.evaluate(
            &thresholds,
            &predictions,
            &stock,
            &cursors,
            job.payload.partition,
            job.scheduled_at,
        );

        let mut notified = 0usize;
        for candidate in evaluation.candidates {
            let outcome = self.sink.upsert_alert(candidate)?;
            if outcome.should_notify() {
                let record = outcome.record();
                match self.notifier.notify(record, channels_for(record.severity)) {
                    Ok(()) => notified += 1,
                    Err(err) => warn!(alert_id = %record.id, error = %err, "alert notification failed"),
                }
            }
        }
        self.sink.advance_cursors(&evaluation.advanced)?;

        info!(
            evaluated = evaluation.advanced.len(),
            skipped_stale = evaluation.skipped_stale,
            notified,
            "evaluation cycle complete"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job.id), err)]
    pub fn cleanup(&self, job: &Job) -> PipelineResult<()> {
        let expired = self.sink.expire_alerts(self.clock.now())?;
        if expired > 0 {
            info!(expired, "expired alerts");
        }
        Ok(())
    }
}
