use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use shoptrack_ai::{ModelArtifact, TrainedModel};
use shoptrack_core::error::poisoned;
use shoptrack_core::{ModelVersion, PipelineResult};

use super::{Arena, ModelStore};

/// In-memory model store for tests/dev.
#[derive(Debug)]
pub struct InMemoryModelStore {
    arena: RwLock<Arena>,
    retention: usize,
}

impl InMemoryModelStore {
    pub fn new(retention: usize) -> Self {
        Self {
            arena: RwLock::new(Arena::default()),
            retention,
        }
    }
}

impl Default for InMemoryModelStore {
    fn default() -> Self {
        Self::new(5)
    }
}

impl ModelStore for InMemoryModelStore {
    fn publish(&self, model: TrainedModel) -> PipelineResult<Arc<ModelArtifact>> {
        let mut arena = self.arena.write().map_err(poisoned)?;
        arena.check_publishable()?;
        if let Some(existing) = arena.published_by(model.source_job) {
            return Ok(existing);
        }

        let version = arena.next_version();
        let artifact = Arc::new(ModelArtifact::from_trained(
            version,
            format!("memory://{}", version.0),
            model,
        ));
        let evicted = arena.install(artifact.clone(), self.retention);
        info!(version = %version, evicted = evicted.len(), "model published");
        Ok(artifact)
    }

    fn current(&self) -> PipelineResult<Option<Arc<ModelArtifact>>> {
        self.arena.read().map_err(poisoned)?.current()
    }

    fn get(&self, version: ModelVersion) -> PipelineResult<Option<Arc<ModelArtifact>>> {
        Ok(self.arena.read().map_err(poisoned)?.get(version))
    }

    fn rollback(&self, version: ModelVersion) -> PipelineResult<Arc<ModelArtifact>> {
        let artifact = self.arena.write().map_err(poisoned)?.set_current(version)?;
        warn!(version = %version, "model rolled back");
        Ok(artifact)
    }

    fn versions(&self) -> PipelineResult<Vec<ModelVersion>> {
        Ok(self.arena.read().map_err(poisoned)?.versions())
    }

    fn halt(&self, reason: String) -> PipelineResult<()> {
        self.arena.write().map_err(poisoned)?.halt(reason);
        Ok(())
    }

    fn resume_publishing(&self) -> PipelineResult<()> {
        self.arena.write().map_err(poisoned)?.resume();
        Ok(())
    }

    fn halted(&self) -> PipelineResult<Option<String>> {
        Ok(self.arena.read().map_err(poisoned)?.halted())
    }
}
