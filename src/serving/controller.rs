//! Live-model slot with atomic promotion.
//!
//! Readers clone the `Arc` held in the slot and keep using it for the whole
//! call, so a promotion never changes the artifact under an in-flight
//! prediction. Promotions and on-demand loads are serialized by a separate
//! mutex so the slot's `RwLock` is only write-held for the pointer swap.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ml::{ArtifactError, ModelArtifact};
use crate::store::{FeedbackDatabase, StoreError, SystemInfo};

/// Externally visible state of the live-model slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Unloaded,
    Loading,
    Live,
    Reloading,
}

enum LiveSlot {
    Unloaded,
    Loading,
    Live(Arc<ModelArtifact>),
    /// A promotion is being applied; readers keep the current artifact.
    Reloading(Arc<ModelArtifact>),
}

impl LiveSlot {
    fn state(&self) -> SlotState {
        match self {
            LiveSlot::Unloaded => SlotState::Unloaded,
            LiveSlot::Loading => SlotState::Loading,
            LiveSlot::Live(_) => SlotState::Live,
            LiveSlot::Reloading(_) => SlotState::Reloading,
        }
    }

    fn artifact(&self) -> Option<Arc<ModelArtifact>> {
        match self {
            LiveSlot::Live(artifact) | LiveSlot::Reloading(artifact) => Some(Arc::clone(artifact)),
            LiveSlot::Unloaded | LiveSlot::Loading => None,
        }
    }
}

/// Reasons a candidate is refused. The previous artifact stays live.
#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("Model has {found} outputs but the label registry has {expected} classes")]
    ClassCountMismatch { expected: usize, found: usize },
    #[error("Model class order {found:?} does not match the label registry {expected:?}")]
    ClassOrderMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("Model expects {found} input features but the pipeline produces {expected}")]
    InputDimMismatch { expected: usize, found: usize },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("Failed to record promotion: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to install artifact at {path}: {source}")]
    Install {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Owns the live-model slot and the persisted artifact.
pub struct ModelSwapController {
    slot: RwLock<LiveSlot>,
    promote_lock: Mutex<()>,
    model_path: PathBuf,
    db_path: PathBuf,
    input_dim: usize,
    last_load_error: Mutex<Option<String>>,
}

impl ModelSwapController {
    /// `input_dim` is the feature length the serving pipeline produces.
    pub fn new(model_path: impl Into<PathBuf>, db_path: impl Into<PathBuf>, input_dim: usize) -> Self {
        Self {
            slot: RwLock::new(LiveSlot::Unloaded),
            promote_lock: Mutex::new(()),
            model_path: model_path.into(),
            db_path: db_path.into(),
            input_dim,
            last_load_error: Mutex::new(None),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn state(&self) -> SlotState {
        self.read_slot().state()
    }

    /// Artifact a reader should use for one whole call.
    pub fn current(&self) -> Option<Arc<ModelArtifact>> {
        self.read_slot().artifact()
    }

    /// Why the last on-demand load failed, if it did.
    pub fn last_load_error(&self) -> Option<String> {
        lock(&self.last_load_error).clone()
    }

    /// Validate `candidate` against the registry and make it live.
    ///
    /// The artifact file, SystemInfo and the in-memory slot change together:
    /// any failure leaves all three as they were.
    pub fn promote(
        &self,
        candidate: ModelArtifact,
        ordered_class_names: &[String],
    ) -> Result<Arc<ModelArtifact>, PromotionError> {
        let _promoting = lock(&self.promote_lock);
        self.check_candidate(&candidate, ordered_class_names)?;

        let previous = {
            let mut slot = self.write_slot();
            let previous = std::mem::replace(&mut *slot, LiveSlot::Loading);
            *slot = match &previous {
                LiveSlot::Live(artifact) | LiveSlot::Reloading(artifact) => {
                    LiveSlot::Reloading(Arc::clone(artifact))
                }
                LiveSlot::Unloaded | LiveSlot::Loading => LiveSlot::Loading,
            };
            previous
        };

        match self.persist(&candidate) {
            Ok(()) => {
                let live = Arc::new(candidate);
                *self.write_slot() = LiveSlot::Live(Arc::clone(&live));
                *lock(&self.last_load_error) = None;
                tracing::info!(
                    "Promoted model {} ({} classes, accuracy {:.3})",
                    live.model_id,
                    live.output_dim(),
                    live.accuracy
                );
                Ok(live)
            }
            Err(err) => {
                *self.write_slot() = match previous {
                    LiveSlot::Live(artifact) | LiveSlot::Reloading(artifact) => {
                        LiveSlot::Live(artifact)
                    }
                    LiveSlot::Unloaded | LiveSlot::Loading => LiveSlot::Unloaded,
                };
                tracing::warn!("Promotion of model {} failed: {err}", candidate.model_id);
                Err(err)
            }
        }
    }

    /// Return the live artifact, loading the persisted one if nothing is live.
    ///
    /// Load failures leave the slot `Unloaded` and are kept for
    /// [`ModelSwapController::last_load_error`].
    pub fn load_on_demand(&self, registry_names: &[String]) -> Option<Arc<ModelArtifact>> {
        if let Some(artifact) = self.current() {
            return Some(artifact);
        }
        if registry_names.is_empty() {
            *lock(&self.last_load_error) = Some("label registry is empty".to_string());
            return None;
        }
        if !self.model_path.is_file() {
            *lock(&self.last_load_error) = Some("no trained model on disk".to_string());
            return None;
        }
        let _loading = lock(&self.promote_lock);
        if let Some(artifact) = self.current() {
            return Some(artifact);
        }
        *self.write_slot() = LiveSlot::Loading;
        match self.load_persisted() {
            Ok(artifact) => {
                if artifact.classes != registry_names {
                    tracing::warn!(
                        "Loaded model {} is stale: trained on {:?}, registry now {:?}",
                        artifact.model_id,
                        artifact.classes,
                        registry_names
                    );
                }
                let live = Arc::new(artifact);
                *self.write_slot() = LiveSlot::Live(Arc::clone(&live));
                *lock(&self.last_load_error) = None;
                tracing::info!("Loaded model {} from disk", live.model_id);
                Some(live)
            }
            Err(err) => {
                *self.write_slot() = LiveSlot::Unloaded;
                tracing::warn!("Model load failed: {err}");
                *lock(&self.last_load_error) = Some(err.to_string());
                None
            }
        }
    }

    fn check_candidate(
        &self,
        candidate: &ModelArtifact,
        ordered_class_names: &[String],
    ) -> Result<(), PromotionError> {
        if candidate.output_dim() != ordered_class_names.len() {
            return Err(PromotionError::ClassCountMismatch {
                expected: ordered_class_names.len(),
                found: candidate.output_dim(),
            });
        }
        if candidate.classes != ordered_class_names {
            return Err(PromotionError::ClassOrderMismatch {
                expected: ordered_class_names.to_vec(),
                found: candidate.classes.clone(),
            });
        }
        if candidate.input_dim != self.input_dim {
            return Err(PromotionError::InputDimMismatch {
                expected: self.input_dim,
                found: candidate.input_dim,
            });
        }
        candidate.validate()?;
        Ok(())
    }

    fn load_persisted(&self) -> Result<ModelArtifact, PromotionError> {
        let artifact = ModelArtifact::load(&self.model_path)?;
        if artifact.input_dim != self.input_dim {
            return Err(PromotionError::InputDimMismatch {
                expected: self.input_dim,
                found: artifact.input_dim,
            });
        }
        Ok(artifact)
    }

    /// Install the artifact file and SystemInfo in one step.
    fn persist(&self, candidate: &ModelArtifact) -> Result<(), PromotionError> {
        let staged = sibling(&self.model_path, "staged");
        let backup = sibling(&self.model_path, "previous");
        candidate.save(&staged)?;

        let db = FeedbackDatabase::connect(&self.db_path)?;
        let mut batch = db.write_batch()?;
        batch.write_system_info(&SystemInfo {
            accuracy: Some(candidate.accuracy),
            last_trained_at: Some(candidate.trained_at),
            total_samples: Some(candidate.total_samples),
            model_id: Some(candidate.model_id.clone()),
        })?;

        let had_previous = self.model_path.is_file();
        if had_previous {
            std::fs::copy(&self.model_path, &backup).map_err(|source| PromotionError::Install {
                path: backup.clone(),
                source,
            })?;
        }
        if let Err(source) = std::fs::rename(&staged, &self.model_path) {
            let _ = std::fs::remove_file(&staged);
            let _ = std::fs::remove_file(&backup);
            return Err(PromotionError::Install {
                path: self.model_path.clone(),
                source,
            });
        }
        if let Err(err) = batch.commit() {
            if had_previous {
                if let Err(restore) = std::fs::rename(&backup, &self.model_path) {
                    tracing::warn!("Failed to restore previous artifact: {restore}");
                }
            } else {
                let _ = std::fs::remove_file(&self.model_path);
            }
            return Err(err.into());
        }
        if had_previous && let Err(err) = std::fs::remove_file(&backup) {
            tracing::debug!("Failed to remove artifact backup {}: {err}", backup.display());
        }
        Ok(())
    }

    fn read_slot(&self) -> std::sync::RwLockReadGuard<'_, LiveSlot> {
        self.slot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, LiveSlot> {
        self.slot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{suffix}"));
    path.with_file_name(name)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
