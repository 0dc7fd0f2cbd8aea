//! Service configuration stored as `refeed.toml` in the app root.
//!
//! Config keys (TOML): `data_dir`, `[training]` (`batch_size`, `epochs`,
//! `learning_rate`, `train_fraction`, `seed`, `max_duration_secs`) and
//! `[pipeline]` (`image_size`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dataset::SplitPolicy;
use crate::ml::Hyperparameters;

mod errors;
mod io;

pub use errors::ConfigError;
pub use io::{config_path, load_from, load_or_default, save, save_to_path};

/// Default filename used to store the service configuration.
pub const CONFIG_FILE_NAME: &str = "refeed.toml";
/// SQLite database filename inside the data dir.
pub const DB_FILE_NAME: &str = "refeed.db";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefeedConfig {
    /// Where the database, media and model live. Defaults to the app root.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// Retrain hyperparameters and partition policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Share of the corpus assigned to the train partition.
    #[serde(default = "default_train_fraction")]
    pub train_fraction: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Optional upper bound on a retrain job's wall time.
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

/// Settings for the default image pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Side length (pixels) images are resized to before normalization.
    #[serde(default = "default_image_size")]
    pub image_size: u32,
}

fn default_batch_size() -> usize {
    32
}

fn default_epochs() -> usize {
    10
}

fn default_learning_rate() -> f32 {
    1e-4
}

fn default_train_fraction() -> f64 {
    0.8
}

fn default_seed() -> u64 {
    42
}

fn default_image_size() -> u32 {
    32
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            train_fraction: default_train_fraction(),
            seed: default_seed(),
            max_duration_secs: None,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            image_size: default_image_size(),
        }
    }
}

impl RefeedConfig {
    /// Clamp values into their supported ranges.
    pub fn normalized(mut self) -> Self {
        self.training.batch_size = self.training.batch_size.max(1);
        self.training.epochs = self.training.epochs.max(1);
        if !self.training.learning_rate.is_finite() || self.training.learning_rate <= 0.0 {
            self.training.learning_rate = default_learning_rate();
        }
        if !(self.training.train_fraction > 0.0 && self.training.train_fraction < 1.0) {
            self.training.train_fraction = default_train_fraction();
        }
        self.pipeline.image_size = self.pipeline.image_size.clamp(4, 512);
        self
    }

    /// Resolve the on-disk layout, falling back to `fallback_root` when no
    /// `data_dir` is configured.
    pub fn layout(&self, fallback_root: &Path) -> DataLayout {
        DataLayout::new(self.data_dir.as_deref().unwrap_or(fallback_root))
    }
}

impl TrainingSettings {
    pub fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters {
            batch_size: self.batch_size,
            epochs: self.epochs,
            learning_rate: self.learning_rate,
        }
    }

    pub fn split_policy(&self) -> SplitPolicy {
        SplitPolicy {
            train_fraction: self.train_fraction,
            seed: self.seed,
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

/// Derived paths under the data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    pub root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn database(&self) -> PathBuf {
        self.root.join(DB_FILE_NAME)
    }

    /// Feedback Store root: one directory per label name.
    pub fn media_root(&self) -> PathBuf {
        self.root.join("media").join("feedback")
    }

    /// Persisted live artifact.
    pub fn model_path(&self) -> PathBuf {
        self.root.join("models").join("classifier.json")
    }

    /// Parent for ephemeral per-job corpora.
    pub fn corpus_work_dir(&self) -> PathBuf {
        self.root.join("work").join("corpus")
    }
}
