//! Training Orchestrator and retrain jobs.
//!
//! The orchestrator assembles a reproducible input (class order, corpus,
//! deterministic split, hyperparameters) and hands the optimization loop to a
//! [`TrainingProcedure`]. It never touches the live model.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{
    CorpusSample, MismatchReport, Partition, SplitPolicy, SyncError, collect_corpus_samples,
    deterministic_split,
};
use crate::ml::metrics::{ConfusionMatrix, PerClassStats, precision_recall_by_class};
use crate::ml::{
    ArtifactError, CancelFlag, EpochMetrics, Hyperparameters, ModelArtifact, ModelSeed,
    ProcedureError, TrainSet, TrainingProcedure,
};
use crate::pipeline::ImagePipeline;

mod jobs;

pub use jobs::{JobId, JobState, JobStatus, MAX_FINISHED_JOBS, RetrainJobs};

/// Errors that abort a training run. The live model is never affected.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// Fewer than two output classes.
    #[error("At least 2 classes are required to train, found {found}")]
    InsufficientClasses { found: usize },
    #[error("Corpus root not found: {0}")]
    CorpusNotFound(PathBuf),
    /// No decodable images across all classes.
    #[error("Corpus has no usable images")]
    EmptyCorpus,
    #[error("Training cancelled: {0}")]
    Cancelled(String),
    #[error(transparent)]
    Sync(SyncError),
    #[error("Training procedure failed: {0}")]
    Procedure(ProcedureError),
    #[error("Trained artifact is invalid: {0}")]
    Artifact(#[from] ArtifactError),
}

impl From<SyncError> for TrainingError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::CorpusNotFound(path) => TrainingError::CorpusNotFound(path),
            other => TrainingError::Sync(other),
        }
    }
}

impl From<ProcedureError> for TrainingError {
    fn from(err: ProcedureError) -> Self {
        match err {
            ProcedureError::Cancelled(reason) => TrainingError::Cancelled(reason),
            other => TrainingError::Procedure(other),
        }
    }
}

/// What a training run produced and how it got there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub classes: Vec<String>,
    pub train_size: usize,
    pub eval_size: usize,
    /// Corpus files the pipeline could not decode.
    pub skipped: usize,
    pub epochs: Vec<EpochMetrics>,
    pub final_accuracy: f32,
    /// Per-class stats on the eval partition (train partition when eval is empty).
    pub per_class: Vec<PerClassStats>,
}

/// Summary attached to a succeeded retrain job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainReport {
    pub model_id: String,
    pub training: TrainingReport,
    pub mismatch: MismatchReport,
}

/// Candidate artifact plus the report that goes with it.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub artifact: ModelArtifact,
    pub report: TrainingReport,
}

/// Drives one training run over a synchronized corpus.
pub struct TrainingOrchestrator {
    pipeline: Arc<dyn ImagePipeline>,
    procedure: Arc<dyn TrainingProcedure>,
    hyperparameters: Hyperparameters,
    split: SplitPolicy,
}

impl TrainingOrchestrator {
    pub fn new(
        pipeline: Arc<dyn ImagePipeline>,
        procedure: Arc<dyn TrainingProcedure>,
        hyperparameters: Hyperparameters,
        split: SplitPolicy,
    ) -> Self {
        Self {
            pipeline,
            procedure,
            hyperparameters,
            split,
        }
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyperparameters
    }

    /// The train/eval partition a run over this corpus would use.
    pub fn partition(
        &self,
        corpus_root: &Path,
        ordered_class_names: &[String],
    ) -> Result<Partition, TrainingError> {
        if ordered_class_names.len() < 2 {
            return Err(TrainingError::InsufficientClasses {
                found: ordered_class_names.len(),
            });
        }
        let samples = collect_corpus_samples(corpus_root, ordered_class_names)?;
        Ok(deterministic_split(samples, self.split))
    }

    /// Train a candidate artifact whose binding is `ordered_class_names`.
    pub fn train(
        &self,
        corpus_root: &Path,
        ordered_class_names: &[String],
        cancel: &CancelFlag,
    ) -> Result<TrainingOutcome, TrainingError> {
        let partition = self.partition(corpus_root, ordered_class_names)?;
        let (train, train_skipped) = self.featurize(&partition.train, cancel)?;
        let (eval, eval_skipped) = self.featurize(&partition.eval, cancel)?;
        let skipped = train_skipped + eval_skipped;
        if skipped > 0 {
            tracing::warn!("Skipped {skipped} corpus images that could not be decoded");
        }
        if train.is_empty() {
            return Err(TrainingError::EmptyCorpus);
        }
        tracing::info!(
            "Training {} classes on {} samples ({} eval)",
            ordered_class_names.len(),
            train.len(),
            eval.len()
        );

        let seed = ModelSeed {
            n_classes: ordered_class_names.len(),
            input_dim: self.pipeline.input_dim(),
            seed: self.split.seed,
        };
        let (weights, epochs) =
            self.procedure
                .train(&seed, &train, &eval, &self.hyperparameters, cancel)?;
        let final_accuracy = epochs
            .last()
            .map(EpochMetrics::headline_accuracy)
            .unwrap_or(0.0);
        let total_samples = (train.len() + eval.len()) as u64;
        let artifact = ModelArtifact::new(
            ordered_class_names.to_vec(),
            seed.input_dim,
            weights.weights,
            weights.bias,
            final_accuracy,
            total_samples,
            crate::store::util::now_epoch_seconds(),
        );
        artifact.validate()?;

        let scored = if eval.is_empty() { &train } else { &eval };
        let per_class = per_class_stats(&artifact, scored, ordered_class_names);
        Ok(TrainingOutcome {
            report: TrainingReport {
                classes: ordered_class_names.to_vec(),
                train_size: train.len(),
                eval_size: eval.len(),
                skipped,
                epochs,
                final_accuracy,
                per_class,
            },
            artifact,
        })
    }

    fn featurize(
        &self,
        samples: &[CorpusSample],
        cancel: &CancelFlag,
    ) -> Result<(TrainSet, usize), TrainingError> {
        let mut set = TrainSet::default();
        let mut skipped = 0usize;
        for sample in samples {
            cancel.check()?;
            let features = std::fs::read(&sample.path)
                .map_err(|err| err.to_string())
                .and_then(|bytes| self.pipeline.features(&bytes).map_err(|err| err.to_string()));
            match features {
                Ok(row) => {
                    set.x.push(row);
                    set.y.push(sample.class_idx);
                }
                Err(err) => {
                    tracing::debug!("Skipping {}: {err}", sample.path.display());
                    skipped += 1;
                }
            }
        }
        Ok((set, skipped))
    }
}

fn per_class_stats(
    artifact: &ModelArtifact,
    set: &TrainSet,
    classes: &[String],
) -> Vec<PerClassStats> {
    let mut cm = ConfusionMatrix::new(classes.len());
    for (x, &y) in set.x.iter().zip(&set.y) {
        if let Ok(prediction) = artifact.predict(x) {
            cm.add(y, prediction.index);
        }
    }
    precision_recall_by_class(&cm, classes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{SoftmaxRegression, TrainedWeights};
    use crate::pipeline::ResizeNormalize;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::fs;
    use tempfile::tempdir;

    fn write_png(path: &Path, color: [u8; 3]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(4, 4, Rgb(color))
            .save_with_format(path, ImageFormat::Png)
            .unwrap();
    }

    fn orchestrator() -> TrainingOrchestrator {
        TrainingOrchestrator::new(
            Arc::new(ResizeNormalize::new(4)),
            Arc::new(SoftmaxRegression::default()),
            Hyperparameters {
                batch_size: 4,
                epochs: 5,
                learning_rate: 0.05,
            },
            SplitPolicy::default(),
        )
    }

    fn classes(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn fewer_than_two_classes_is_rejected() {
        let dir = tempdir().unwrap();
        let err = orchestrator()
            .train(dir.path(), &classes(&["pizza"]), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, TrainingError::InsufficientClasses { found: 1 }));
    }

    #[test]
    fn missing_corpus_is_reported() {
        let dir = tempdir().unwrap();
        let err = orchestrator()
            .train(
                &dir.path().join("gone"),
                &classes(&["pizza", "steak"]),
                &CancelFlag::new(),
            )
            .unwrap_err();
        assert!(matches!(err, TrainingError::CorpusNotFound(_)));
    }

    #[test]
    fn undecodable_only_corpus_is_empty() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pizza")).unwrap();
        fs::write(dir.path().join("pizza").join("junk.png"), b"junk").unwrap();
        let err = orchestrator()
            .train(dir.path(), &classes(&["pizza", "steak"]), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, TrainingError::EmptyCorpus));
    }

    #[test]
    fn trains_artifact_bound_to_class_order() {
        let dir = tempdir().unwrap();
        for idx in 0..5 {
            write_png(&dir.path().join("pizza").join(format!("{idx}.png")), [250, 10, 10]);
            write_png(&dir.path().join("steak").join(format!("{idx}.png")), [10, 10, 250]);
        }
        fs::write(dir.path().join("steak").join("broken.png"), b"nope").unwrap();
        let names = classes(&["pizza", "steak"]);
        let outcome = orchestrator()
            .train(dir.path(), &names, &CancelFlag::new())
            .unwrap();
        assert_eq!(outcome.artifact.classes, names);
        assert_eq!(outcome.artifact.output_dim(), 2);
        assert_eq!(outcome.report.skipped, 1);
        assert_eq!(outcome.report.epochs.len(), 5);
        assert_eq!(
            outcome.report.train_size + outcome.report.eval_size + outcome.report.skipped,
            11
        );
        assert_eq!(outcome.artifact.total_samples, 10);
    }

    struct Fixed;

    impl TrainingProcedure for Fixed {
        fn train(
            &self,
            seed: &ModelSeed,
            _train: &TrainSet,
            _eval: &TrainSet,
            _hyperparameters: &Hyperparameters,
            cancel: &CancelFlag,
        ) -> Result<(TrainedWeights, Vec<EpochMetrics>), ProcedureError> {
            cancel.check()?;
            Ok((
                TrainedWeights {
                    weights: vec![0.0; seed.n_classes * seed.input_dim],
                    bias: vec![0.0; seed.n_classes],
                },
                Vec::new(),
            ))
        }
    }

    #[test]
    fn cancellation_surfaces_as_cancelled() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("pizza").join("a.png"), [1, 2, 3]);
        let orchestrator = TrainingOrchestrator::new(
            Arc::new(ResizeNormalize::new(4)),
            Arc::new(Fixed),
            Hyperparameters::default(),
            SplitPolicy::default(),
        );
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = orchestrator
            .train(dir.path(), &classes(&["pizza", "steak"]), &cancel)
            .unwrap_err();
        assert!(matches!(err, TrainingError::Cancelled(_)));
    }
}
