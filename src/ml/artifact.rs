//! Persisted model artifact with an explicit class-order binding.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::softmax;
use crate::fs_ops::write_atomic;

/// Current on-disk format version.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Failed to read artifact {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Artifact {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid artifact: {0}")]
    Invalid(String),
    #[error("Artifact checksum mismatch (expected {expected}, found {found})")]
    ChecksumMismatch { expected: String, found: String },
}

/// Trained weights plus the ordered class names they were trained against.
///
/// Output index `i` means `classes[i]`; nothing outside this type interprets
/// `weights` or `bias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub model_id: String,
    /// Class-order binding captured at training time.
    pub classes: Vec<String>,
    pub input_dim: usize,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    /// Headline accuracy reported by training.
    pub accuracy: f32,
    /// Samples in the corpus the artifact was trained on.
    pub total_samples: u64,
    /// Epoch seconds.
    pub trained_at: i64,
    /// blake3 hex digest over the binding and weights.
    pub checksum: String,
}

/// Outcome of running one feature vector through an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub index: usize,
    pub label: String,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
    pub model_id: String,
}

impl ModelArtifact {
    pub fn new(
        classes: Vec<String>,
        input_dim: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
        accuracy: f32,
        total_samples: u64,
        trained_at: i64,
    ) -> Self {
        let mut artifact = Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            model_id: Uuid::new_v4().to_string(),
            classes,
            input_dim,
            weights,
            bias,
            accuracy,
            total_samples,
            trained_at,
            checksum: String::new(),
        };
        artifact.checksum = artifact.compute_checksum();
        artifact
    }

    /// Number of model outputs.
    pub fn output_dim(&self) -> usize {
        self.bias.len()
    }

    /// Check structural invariants and the stored checksum.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ArtifactError::Invalid(format!(
                "Unsupported format version {}",
                self.format_version
            )));
        }
        if self.input_dim == 0 {
            return Err(ArtifactError::Invalid("input_dim must be > 0".to_string()));
        }
        if self.classes.len() != self.output_dim() {
            return Err(ArtifactError::Invalid(format!(
                "Binding names {} classes but model has {} outputs",
                self.classes.len(),
                self.output_dim()
            )));
        }
        if self.weights.len() != self.output_dim() * self.input_dim {
            return Err(ArtifactError::Invalid("weights length mismatch".to_string()));
        }
        if self
            .weights
            .iter()
            .chain(&self.bias)
            .any(|value| !value.is_finite())
        {
            return Err(ArtifactError::Invalid("non-finite weights".to_string()));
        }
        let found = self.compute_checksum();
        if found != self.checksum {
            return Err(ArtifactError::ChecksumMismatch {
                expected: self.checksum.clone(),
                found,
            });
        }
        Ok(())
    }

    /// Class probabilities for one feature vector, or empty on a size mismatch.
    pub fn predict_proba(&self, features: &[f32]) -> Vec<f32> {
        if features.len() != self.input_dim {
            return Vec::new();
        }
        let logits: Vec<f32> = (0..self.output_dim())
            .map(|c| {
                let row = &self.weights[c * self.input_dim..(c + 1) * self.input_dim];
                self.bias[c] + row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>()
            })
            .collect();
        softmax(&logits)
    }

    /// Best class for one feature vector, resolved through this artifact's binding.
    pub fn predict(&self, features: &[f32]) -> Result<Prediction, ArtifactError> {
        let probabilities = self.predict_proba(features);
        if probabilities.is_empty() {
            return Err(ArtifactError::Invalid(format!(
                "Expected {} features, got {}",
                self.input_dim,
                features.len()
            )));
        }
        let (index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (idx, p)| {
                if p > best.1 { (idx, p) } else { best }
            });
        let label = self
            .classes
            .get(index)
            .cloned()
            .ok_or_else(|| ArtifactError::Invalid(format!("Output {index} has no class")))?;
        Ok(Prediction {
            index,
            label,
            confidence,
            probabilities,
            model_id: self.model_id.clone(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let data = serde_json::to_vec(self).map_err(|source| ArtifactError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, &data).map_err(|source| ArtifactError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read and validate an artifact.
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let data = std::fs::read(path).map_err(|source| ArtifactError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let artifact: Self = serde_json::from_slice(&data).map_err(|source| ArtifactError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        artifact.validate()?;
        Ok(artifact)
    }

    fn compute_checksum(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.input_dim as u64).to_le_bytes());
        for class in &self.classes {
            hasher.update(&(class.len() as u64).to_le_bytes());
            hasher.update(class.as_bytes());
        }
        for value in self.weights.iter().chain(&self.bias) {
            hasher.update(&value.to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}
