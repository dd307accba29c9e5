//! Model Store: versioned artifacts with an atomically swapped "current" pointer.
//!
//! ## Design
//!
//! - Artifacts are immutable once published; only the current pointer moves.
//! - Readers get an `Arc<ModelArtifact>`: a pinned, complete artifact that stays
//!   valid for the whole job even if a newer version is published meanwhile.
//! - The last `retention` versions are kept for rollback; the current one is never evicted.
//! - An observed invariant violation halts publishing until an operator resumes it.

pub mod fs;
pub mod memory;

pub use fs::FsModelStore;
pub use memory::InMemoryModelStore;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use shoptrack_ai::{ModelArtifact, TrainedModel};
use shoptrack_core::{JobId, ModelVersion, PipelineError, PipelineResult};

pub trait ModelStore: Send + Sync {
    /// Persist `model` as a new version and make it current.
    ///
    /// Idempotent per `source_job`: republishing from the same RETRAIN job
    /// returns the version already published.
    fn publish(&self, model: TrainedModel) -> PipelineResult<Arc<ModelArtifact>>;

    /// The artifact new jobs should pin; `None` before the first publish.
    fn current(&self) -> PipelineResult<Option<Arc<ModelArtifact>>>;

    fn get(&self, version: ModelVersion) -> PipelineResult<Option<Arc<ModelArtifact>>>;

    /// Make a retained older version current again.
    fn rollback(&self, version: ModelVersion) -> PipelineResult<Arc<ModelArtifact>>;

    /// Retained versions, ascending.
    fn versions(&self) -> PipelineResult<Vec<ModelVersion>>;

    fn halt(&self, reason: String) -> PipelineResult<()>;

    fn resume_publishing(&self) -> PipelineResult<()>;

    /// Reason publishing is halted, if it is.
    fn halted(&self) -> PipelineResult<Option<String>>;
}

/// Arena of retained versions plus the current index.
///
/// Shared by the in-memory and filesystem stores; always mutated under one lock.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    artifacts: BTreeMap<ModelVersion, Arc<ModelArtifact>>,
    current: Option<ModelVersion>,
    latest: ModelVersion,
    by_job: HashMap<JobId, ModelVersion>,
    halted: Option<String>,
}

impl Arena {
    pub(crate) fn next_version(&self) -> ModelVersion {
        self.latest.next()
    }

    pub(crate) fn check_publishable(&self) -> PipelineResult<()> {
        match &self.halted {
            Some(reason) => Err(PipelineError::invariant(format!(
                "model publishing halted: {reason}"
            ))),
            None => Ok(()),
        }
    }

    /// Artifact already published by this job, if still retained.
    pub(crate) fn published_by(&self, job: Option<JobId>) -> Option<Arc<ModelArtifact>> {
        let version = self.by_job.get(&job?)?;
        self.artifacts.get(version).cloned()
    }

    /// Insert a fully written artifact and swap the current pointer to it.
    ///
    /// Returns versions evicted by retention (callers delete their backing data).
    pub(crate) fn install(&mut self, artifact: Arc<ModelArtifact>, retention: usize) -> Vec<ModelVersion> {
        let version = artifact.version;
        if let Some(job) = artifact.source_job {
            self.by_job.insert(job, version);
        }
        self.artifacts.insert(version, artifact);
        self.latest = self.latest.max(version);
        self.current = Some(version);
        self.trim(retention)
    }

    /// Load an existing artifact without moving the current pointer (used when reopening).
    pub(crate) fn restore(&mut self, artifact: Arc<ModelArtifact>) {
        let version = artifact.version;
        if let Some(job) = artifact.source_job {
            self.by_job.insert(job, version);
        }
        self.latest = self.latest.max(version);
        self.artifacts.insert(version, artifact);
    }

    pub(crate) fn set_current(&mut self, version: ModelVersion) -> PipelineResult<Arc<ModelArtifact>> {
        let artifact = self.artifacts.get(&version).cloned().ok_or_else(|| {
            PipelineError::invalid_input(format!("model {version} is not retained"))
        })?;
        self.current = Some(version);
        Ok(artifact)
    }

    pub(crate) fn current(&self) -> PipelineResult<Option<Arc<ModelArtifact>>> {
        match self.current {
            None => Ok(None),
            Some(v) => self.artifacts.get(&v).cloned().map(Some).ok_or_else(|| {
                PipelineError::invariant(format!("current pointer names {v}, which is not stored"))
            }),
        }
    }

    pub(crate) fn get(&self, version: ModelVersion) -> Option<Arc<ModelArtifact>> {
        self.artifacts.get(&version).cloned()
    }

    pub(crate) fn versions(&self) -> Vec<ModelVersion> {
        self.artifacts.keys().copied().collect()
    }

    pub(crate) fn halt(&mut self, reason: String) {
        self.halted = Some(reason);
    }

    pub(crate) fn resume(&mut self) {
        self.halted = None;
    }

    pub(crate) fn halted(&self) -> Option<String> {
        self.halted.clone()
    }

    fn trim(&mut self, retention: usize) -> Vec<ModelVersion> {
        let retention = retention.max(1);
        let mut evicted = Vec::new();
        while self.artifacts.len() > retention {
            let oldest = self
                .artifacts
                .keys()
                .copied()
                .find(|v| Some(*v) != self.current);
            match oldest {
                Some(v) => {
                    self.artifacts.remove(&v);
                    self.by_job.retain(|_, kept| *kept != v);
                    evicted.push(v);
                }
                None => break,
            }
        }
        evicted
    }
}
