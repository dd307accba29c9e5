//! Filesystem-backed model store.
//!
//! Layout under the root directory:
//!
//! ```text
//! models/v{N}.json   immutable artifacts
//! CURRENT            version number of the current artifact
//! HALTED             present while publishing is halted (contains the reason)
//! ```
//!
//! Every file is written to a temporary sibling, fsynced and renamed into place.
//! The artifact is durable before `CURRENT` moves, so a crash at any point leaves
//! either the previous or the new version current, never a partial one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, instrument, warn};

use shoptrack_ai::{ModelArtifact, TrainedModel};
use shoptrack_core::error::poisoned;
use shoptrack_core::{ModelVersion, PipelineError, PipelineResult};

use super::{Arena, ModelStore};

const CURRENT_FILE: &str = "CURRENT";
const HALTED_FILE: &str = "HALTED";
const MODELS_DIR: &str = "models";

#[derive(Debug)]
pub struct FsModelStore {
    root: PathBuf,
    retention: usize,
    arena: RwLock<Arena>,
    /// Serializes publishers; readers only take `arena` briefly.
    publish_lock: Mutex<()>,
}

fn io_err(op: &str, path: &Path, err: std::io::Error) -> PipelineError {
    PipelineError::store(format!("{op} {}: {err}", path.display()))
}

fn sync_dir(dir: &Path) -> PipelineResult<()> {
    #[cfg(unix)]
    {
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| io_err("fsync dir", dir, e))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Write `bytes` to `path` via tmp file + fsync + rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| io_err("create", &tmp, e))?;
        file.write_all(bytes).map_err(|e| io_err("write", &tmp, e))?;
        file.sync_all().map_err(|e| io_err("fsync", &tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_err("rename", path, e))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

impl FsModelStore {
    /// Open (or initialize) a store rooted at `root`.
    ///
    /// Fails with `InvariantViolation` when `CURRENT` names an artifact that is missing or unreadable.
    #[instrument(skip_all, fields(root = %root.as_ref().display()), err)]
    pub fn open(root: impl AsRef<Path>, retention: usize) -> PipelineResult<Self> {
        let root = root.as_ref().to_path_buf();
        let models = root.join(MODELS_DIR);
        fs::create_dir_all(&models).map_err(|e| io_err("create dir", &models, e))?;

        let mut arena = Arena::default();
        let entries = fs::read_dir(&models).map_err(|e| io_err("read dir", &models, e))?;
        for entry in entries {
            let path = entry.map_err(|e| io_err("read dir", &models, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                // Leftover tmp files from an interrupted publish.
                continue;
            }
            match Self::read_artifact(&path) {
                Ok(artifact) => arena.restore(Arc::new(artifact)),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable artifact"),
            }
        }

        let current_path = root.join(CURRENT_FILE);
        if current_path.exists() {
            let raw = fs::read_to_string(&current_path).map_err(|e| io_err("read", &current_path, e))?;
            let version: u64 = raw.trim().parse().map_err(|_| {
                PipelineError::invariant(format!("CURRENT holds {raw:?}, not a version"))
            })?;
            arena
                .set_current(ModelVersion(version))
                .map_err(|_| PipelineError::invariant(format!("CURRENT names v{version}, which is not stored")))?;
        }

        let halted_path = root.join(HALTED_FILE);
        if halted_path.exists() {
            let reason = fs::read_to_string(&halted_path).map_err(|e| io_err("read", &halted_path, e))?;
            arena.halt(reason);
        }

        info!(versions = arena.versions().len(), "model store opened");
        Ok(Self {
            root,
            retention,
            arena: RwLock::new(arena),
            publish_lock: Mutex::new(()),
        })
    }

    fn artifact_path(&self, version: ModelVersion) -> PathBuf {
        self.root.join(MODELS_DIR).join(format!("{version}.json"))
    }

    fn read_artifact(path: &Path) -> PipelineResult<ModelArtifact> {
        let raw = fs::read(path).map_err(|e| io_err("read", path, e))?;
        serde_json::from_slice(&raw)
            .map_err(|e| PipelineError::invariant(format!("artifact {} unreadable: {e}", path.display())))
    }

    fn write_current(&self, version: ModelVersion) -> PipelineResult<()> {
        write_atomic(&self.root.join(CURRENT_FILE), version.0.to_string().as_bytes())
    }
}

impl ModelStore for FsModelStore {
    #[instrument(skip_all, fields(source_job = ?model.source_job), err)]
    fn publish(&self, model: TrainedModel) -> PipelineResult<Arc<ModelArtifact>> {
        let _guard = self.publish_lock.lock().map_err(poisoned)?;

        let version = {
            let arena = self.arena.read().map_err(poisoned)?;
            arena.check_publishable()?;
            if let Some(existing) = arena.published_by(model.source_job) {
                return Ok(existing);
            }
            arena.next_version()
        };

        let path = self.artifact_path(version);
        let artifact = ModelArtifact::from_trained(version, path.display().to_string(), model);
        let bytes = serde_json::to_vec_pretty(&artifact)
            .map_err(|e| PipelineError::invariant(format!("artifact not serializable: {e}")))?;

        // Artifact first, pointer second.
        write_atomic(&path, &bytes)?;
        self.write_current(version)?;

        let artifact = Arc::new(artifact);
        let evicted = self
            .arena
            .write()
            .map_err(poisoned)?
            .install(artifact.clone(), self.retention);

        for old in &evicted {
            let old_path = self.artifact_path(*old);
            if let Err(err) = fs::remove_file(&old_path) {
                warn!(path = %old_path.display(), error = %err, "failed to remove evicted artifact");
            }
        }
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
        let _guard = self.publish_lock.lock().map_err(poisoned)?;
        if self.arena.read().map_err(poisoned)?.get(version).is_none() {
            return Err(PipelineError::invalid_input(format!(
                "model {version} is not retained"
            )));
        }
        self.write_current(version)?;
        let artifact = self.arena.write().map_err(poisoned)?.set_current(version)?;
        warn!(version = %version, "model rolled back");
        Ok(artifact)
    }

    fn versions(&self) -> PipelineResult<Vec<ModelVersion>> {
        Ok(self.arena.read().map_err(poisoned)?.versions())
    }

    fn halt(&self, reason: String) -> PipelineResult<()> {
        write_atomic(&self.root.join(HALTED_FILE), reason.as_bytes())?;
        self.arena.write().map_err(poisoned)?.halt(reason);
        Ok(())
    }

    fn resume_publishing(&self) -> PipelineResult<()> {
        let path = self.root.join(HALTED_FILE);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("remove", &path, e)),
        }
        self.arena.write().map_err(poisoned)?.resume();
        Ok(())
    }

    fn halted(&self) -> PipelineResult<Option<String>> {
        Ok(self.arena.read().map_err(poisoned)?.halted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shoptrack_ai::ModelMetrics;
    use shoptrack_core::JobId;

    fn model(n: usize) -> TrainedModel {
        TrainedModel {
            forecaster: "test".into(),
            trained_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            metrics: ModelMetrics {
                training_rows: n,
                ..ModelMetrics::default()
            },
            params: serde_json::json!({ "n": n }),
            source_job: Some(JobId::new()),
        }
    }

    #[test]
    fn reopen_restores_current_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsModelStore::open(dir.path(), 5).unwrap();
            store.publish(model(1)).unwrap();
            store.publish(model(2)).unwrap();
            store.rollback(ModelVersion(1)).unwrap();
        }
        let store = FsModelStore::open(dir.path(), 5).unwrap();
        assert_eq!(store.current().unwrap().unwrap().version, ModelVersion(1));
        assert_eq!(store.versions().unwrap(), vec![ModelVersion(1), ModelVersion(2)]);
        // Numbering continues after the highest stored version.
        assert_eq!(store.publish(model(3)).unwrap().version, ModelVersion(3));
    }

    #[test]
    fn interrupted_publish_keeps_previous_current() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsModelStore::open(dir.path(), 5).unwrap();
            store.publish(model(1)).unwrap();
        }
        // Crash after the artifact tmp file was written but before rename.
        fs::write(dir.path().join(MODELS_DIR).join("v2.tmp"), b"{\"partial\":").unwrap();

        let store = FsModelStore::open(dir.path(), 5).unwrap();
        assert_eq!(store.current().unwrap().unwrap().version, ModelVersion(1));
        assert_eq!(store.versions().unwrap(), vec![ModelVersion(1)]);
    }

    #[test]
    fn dangling_current_pointer_is_an_invariant_violation() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(MODELS_DIR)).unwrap();
        fs::write(dir.path().join(CURRENT_FILE), b"7").unwrap();
        let err = FsModelStore::open(dir.path(), 5).unwrap_err();
        assert!(matches!(err, PipelineError::InvariantViolation(_)));
    }

    #[test]
    fn eviction_removes_files_but_not_current() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsModelStore::open(dir.path(), 2).unwrap();
        for n in 1..=4 {
            store.publish(model(n)).unwrap();
        }
        assert!(!dir.path().join(MODELS_DIR).join("v1.json").exists());
        assert!(!dir.path().join(MODELS_DIR).join("v2.json").exists());
        assert!(dir.path().join(MODELS_DIR).join("v4.json").exists());
        assert_eq!(store.current().unwrap().unwrap().version, ModelVersion(4));
    }

    #[test]
    fn halt_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsModelStore::open(dir.path(), 5).unwrap();
            store.halt("current pointer mismatch".into()).unwrap();
        }
        let store = FsModelStore::open(dir.path(), 5).unwrap();
        assert_eq!(store.halted().unwrap().as_deref(), Some("current pointer mismatch"));
        assert!(store.publish(model(1)).is_err());
        store.resume_publishing().unwrap();
        assert!(store.publish(model(1)).is_ok());
    }
}
