//! Persisted last-fired slot per job kind.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shoptrack_core::error::poisoned;
use shoptrack_core::{PipelineError, PipelineResult};

use crate::jobs::JobKind;
use crate::model_store::fs::write_atomic;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Slot index (`floor(unix_secs / interval_secs)`) last enqueued per kind.
    pub last_fired: BTreeMap<JobKind, i64>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

pub trait SchedulerStateStore: Send + Sync {
    fn load(&self) -> PipelineResult<SchedulerState>;
    fn save(&self, state: &SchedulerState) -> PipelineResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    state: RwLock<SchedulerState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulerStateStore for InMemoryStateStore {
    fn load(&self) -> PipelineResult<SchedulerState> {
        Ok(self.state.read().map_err(poisoned)?.clone())
    }

    fn save(&self, state: &SchedulerState) -> PipelineResult<()> {
        *self.state.write().map_err(poisoned)? = state.clone();
        Ok(())
    }
}

/// JSON file replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SchedulerStateStore for JsonFileStateStore {
    fn load(&self) -> PipelineResult<SchedulerState> {
        match fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                PipelineError::corrupt(format!("scheduler state {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SchedulerState::default()),
            Err(e) => Err(PipelineError::store(format!(
                "read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, state: &SchedulerState) -> PipelineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PipelineError::store(format!("create {}: {e}", parent.display())))?;
        }
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| PipelineError::invariant(format!("scheduler state not serializable: {e}")))?;
        write_atomic(&self.path, &bytes)
    }
}
