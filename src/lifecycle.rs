//! Facade over the lifecycle components.
//!
//! Exposes the operations a transport layer needs (predict, submit feedback,
//! label and feedback administration, retrain jobs, stats) and classifies
//! every failure so the transport can map it to a response.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{DataLayout, RefeedConfig};
use crate::dataset::{DatasetSynchronizer, SyncError};
use crate::feedback::{DeleteOutcome, FeedbackError, FeedbackStore, LabelDeletion, LabelTarget};
use crate::ml::{CancelFlag, SoftmaxRegression, TrainingProcedure};
use crate::pipeline::{ImagePipeline, ResizeNormalize};
use crate::serving::{
    ModelSwapController, PredictionError, PredictionOutcome, PredictionServer, PromotionError,
    SlotState,
};
use crate::store::{
    Correctness, FeedbackPage, FeedbackSample, Label, LabelRef, LabelSummary, Page, SampleId,
    StoreError, SystemInfo,
};
use crate::training::{
    JobId, JobStatus, RetrainJobs, RetrainReport, TrainingError, TrainingOrchestrator,
};

/// Broad failure classes a transport maps onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input; fix the request (400).
    Validation,
    /// No model available; retry later (503).
    Unavailable,
    /// Retrain aborted (500).
    Training,
    /// Candidate refused; previous model still live (500).
    Promotion,
    /// Conflicts with current state (409).
    Conflict,
    Internal,
}

impl ErrorClass {
    /// Conventional HTTP status for this class.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorClass::Validation => 400,
            ErrorClass::Unavailable => 503,
            ErrorClass::Conflict => 409,
            ErrorClass::Training | ErrorClass::Promotion | ErrorClass::Internal => 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Feedback(#[from] FeedbackError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Promotion(#[from] PromotionError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// A submission is missing the label its correctness requires.
    #[error("{0}")]
    MissingLabel(&'static str),
    #[error("A retrain job is already running: {0}")]
    RetrainInProgress(JobId),
    #[error("Retrain job not found: {0}")]
    JobNotFound(String),
    #[error("Failed to prepare data directory {path}: {source}")]
    DataDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl LifecycleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LifecycleError::Store(err) => store_class(err),
            LifecycleError::Feedback(err) => feedback_class(err),
            LifecycleError::Prediction(err) => match err {
                PredictionError::EmptyImage | PredictionError::InvalidImage(_) => {
                    ErrorClass::Validation
                }
                PredictionError::ModelUnavailable(_) => ErrorClass::Unavailable,
                PredictionError::Feedback(err) => feedback_class(err),
                PredictionError::Inference(_) => ErrorClass::Internal,
            },
            LifecycleError::Training(_) | LifecycleError::Sync(_) => ErrorClass::Training,
            LifecycleError::Promotion(_) => ErrorClass::Promotion,
            LifecycleError::MissingLabel(_) => ErrorClass::Validation,
            LifecycleError::RetrainInProgress(_) => ErrorClass::Conflict,
            LifecycleError::JobNotFound(_) => ErrorClass::Validation,
            LifecycleError::DataDir { .. } => ErrorClass::Internal,
        }
    }
}

fn store_class(err: &StoreError) -> ErrorClass {
    match err {
        StoreError::InvalidLabelName(_)
        | StoreError::LabelNotFound(_)
        | StoreError::SampleNotFound(_)
        | StoreError::PathMustBeRelative(_)
        | StoreError::InvalidRelativePath(_) => ErrorClass::Validation,
        StoreError::DuplicateLabel(_)
        | StoreError::LabelInUse { .. }
        | StoreError::StaleSample(_) => ErrorClass::Conflict,
        StoreError::Busy => ErrorClass::Unavailable,
        StoreError::Sql(_) | StoreError::CreateDir { .. } | StoreError::Unexpected => {
            ErrorClass::Internal
        }
    }
}

fn feedback_class(err: &FeedbackError) -> ErrorClass {
    match err {
        FeedbackError::Store(err) => store_class(err),
        FeedbackError::EmptyImage | FeedbackError::UnrecognizedImage => ErrorClass::Validation,
        FeedbackError::Io { .. } => ErrorClass::Internal,
    }
}

/// A feedback submission as received from a caller.
#[derive(Debug, Clone)]
pub struct FeedbackSubmission<'a> {
    pub image: &'a [u8],
    pub correctness: Correctness,
    /// Name the model predicted; required when the prediction was correct.
    pub predicted_label: Option<String>,
    /// Existing label the user chose; required otherwise.
    pub corrected_label: Option<LabelRef>,
}

/// Registry, storage and live-model figures for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub info: SystemInfo,
    pub slot: SlotState,
    pub live_model_id: Option<String>,
    pub label_count: u64,
    pub sample_count: u64,
    pub last_load_error: Option<String>,
    pub running_job: Option<JobId>,
}

/// Wires the store, synchronizer, orchestrator, swap controller and
/// prediction server together.
pub struct Lifecycle {
    store: FeedbackStore,
    synchronizer: DatasetSynchronizer,
    orchestrator: Arc<TrainingOrchestrator>,
    controller: Arc<ModelSwapController>,
    server: PredictionServer,
    jobs: RetrainJobs,
    max_retrain_duration: Option<Duration>,
}

impl Lifecycle {
    /// Open with the default pipeline and training procedure.
    pub fn open(config: &RefeedConfig, fallback_root: &Path) -> Result<Self, LifecycleError> {
        let pipeline: Arc<dyn ImagePipeline> =
            Arc::new(ResizeNormalize::new(config.pipeline.image_size));
        Self::open_with(
            config,
            config.layout(fallback_root),
            pipeline,
            Arc::new(SoftmaxRegression::default()),
        )
    }

    /// Open with explicit collaborators.
    pub fn open_with(
        config: &RefeedConfig,
        layout: DataLayout,
        pipeline: Arc<dyn ImagePipeline>,
        procedure: Arc<dyn TrainingProcedure>,
    ) -> Result<Self, LifecycleError> {
        std::fs::create_dir_all(&layout.root).map_err(|source| LifecycleError::DataDir {
            path: layout.root.clone(),
            source,
        })?;
        let store = FeedbackStore::open(layout.database(), layout.media_root())?;
        let synchronizer = DatasetSynchronizer::new(layout.media_root(), layout.corpus_work_dir());
        if let Err(err) = synchronizer.sweep_stale() {
            tracing::warn!("Failed to sweep stale corpora: {err}");
        }
        let orchestrator = Arc::new(TrainingOrchestrator::new(
            Arc::clone(&pipeline),
            procedure,
            config.training.hyperparameters(),
            config.training.split_policy(),
        ));
        let controller = Arc::new(ModelSwapController::new(
            layout.model_path(),
            layout.database(),
            pipeline.input_dim(),
        ));
        let server = PredictionServer::new(Arc::clone(&controller), pipeline, store.clone());
        tracing::info!("Lifecycle opened at {}", layout.root.display());
        Ok(Self {
            store,
            synchronizer,
            orchestrator,
            controller,
            server,
            jobs: RetrainJobs::new(),
            max_retrain_duration: config.training.max_duration(),
        })
    }

    pub fn store(&self) -> &FeedbackStore {
        &self.store
    }

    pub fn controller(&self) -> &Arc<ModelSwapController> {
        &self.controller
    }

    pub fn orchestrator(&self) -> &Arc<TrainingOrchestrator> {
        &self.orchestrator
    }

    pub fn synchronizer(&self) -> &DatasetSynchronizer {
        &self.synchronizer
    }

    pub fn predict(
        &self,
        image: &[u8],
        ground_truth: Option<&LabelRef>,
    ) -> Result<PredictionOutcome, LifecycleError> {
        Ok(self.server.predict(image, ground_truth)?)
    }

    /// Store user feedback.
    ///
    /// A correct prediction files the image under the predicted name,
    /// creating that label if needed. Incorrect and unknown outcomes need an
    /// existing label.
    pub fn submit_feedback(
        &self,
        submission: FeedbackSubmission<'_>,
    ) -> Result<FeedbackSample, LifecycleError> {
        let target = match submission.correctness {
            Correctness::Correct => {
                let name = submission
                    .predicted_label
                    .filter(|name| !name.trim().is_empty())
                    .ok_or(LifecycleError::MissingLabel(
                        "Correct feedback requires the predicted label",
                    ))?;
                LabelTarget::GetOrCreate(name)
            }
            Correctness::Incorrect => LabelTarget::Existing(submission.corrected_label.ok_or(
                LifecycleError::MissingLabel("Incorrect feedback requires a corrected label"),
            )?),
            Correctness::Unknown => {
                let label = submission
                    .corrected_label
                    .or_else(|| submission.predicted_label.map(LabelRef::Name))
                    .ok_or(LifecycleError::MissingLabel("Feedback requires a label"))?;
                LabelTarget::Existing(label)
            }
        };
        Ok(self
            .store
            .submit(submission.image, &target, submission.correctness)?)
    }

    pub fn list_labels(&self) -> Result<Vec<LabelSummary>, LifecycleError> {
        Ok(self.store.list_labels()?)
    }

    pub fn create_label(&self, name: &str) -> Result<Label, LifecycleError> {
        Ok(self.store.create_label(name)?)
    }

    pub fn delete_label(
        &self,
        label: &LabelRef,
        cascade: bool,
    ) -> Result<LabelDeletion, LifecycleError> {
        Ok(self.store.delete_label(label, cascade)?)
    }

    pub fn list_feedback(
        &self,
        page: Page,
        label: Option<&LabelRef>,
    ) -> Result<FeedbackPage, LifecycleError> {
        Ok(self.store.list(page, label)?)
    }

    pub fn get_feedback(&self, id: SampleId) -> Result<FeedbackSample, LifecycleError> {
        Ok(self.store.sample(id)?)
    }

    pub fn feedback_by_token(&self, token: &Uuid) -> Result<Option<FeedbackSample>, LifecycleError> {
        Ok(self.store.sample_by_token(token)?)
    }

    pub fn reassign_feedback(
        &self,
        id: SampleId,
        label: &LabelRef,
    ) -> Result<FeedbackSample, LifecycleError> {
        Ok(self.store.reassign(id, label)?)
    }

    pub fn delete_feedback(&self, id: SampleId) -> Result<DeleteOutcome, LifecycleError> {
        Ok(self.store.delete(id)?)
    }

    /// Start a retrain job: synchronize, train, then promote.
    pub fn trigger_retrain(&self) -> Result<JobId, LifecycleError> {
        let store = self.store.clone();
        let synchronizer = self.synchronizer.clone();
        let orchestrator = Arc::clone(&self.orchestrator);
        let controller = Arc::clone(&self.controller);
        self.jobs
            .trigger(self.max_retrain_duration, move |job_id, cancel| {
                run_retrain(
                    job_id,
                    cancel,
                    &store,
                    &synchronizer,
                    &orchestrator,
                    &controller,
                )
            })
            .map_err(LifecycleError::RetrainInProgress)
    }

    pub fn retrain_status(&self, id: &str) -> Result<JobStatus, LifecycleError> {
        self.jobs
            .status(id)
            .ok_or_else(|| LifecycleError::JobNotFound(id.to_string()))
    }

    pub fn wait_for_retrain(&self, id: &str, timeout: Duration) -> Result<JobStatus, LifecycleError> {
        self.jobs
            .wait(id, timeout)
            .ok_or_else(|| LifecycleError::JobNotFound(id.to_string()))
    }

    pub fn cancel_retrain(&self, id: &str) -> bool {
        self.jobs.cancel(id)
    }

    pub fn latest_retrain(&self) -> Option<JobStatus> {
        self.jobs.latest()
    }

    pub fn system_stats(&self) -> Result<SystemStats, LifecycleError> {
        let db = self.store.connect()?;
        Ok(SystemStats {
            info: db.system_info()?,
            slot: self.controller.state(),
            live_model_id: self
                .controller
                .current()
                .map(|artifact| artifact.model_id.clone()),
            label_count: db.count_labels()?,
            sample_count: db.count_samples()?,
            last_load_error: self.controller.last_load_error(),
            running_job: self.jobs.running(),
        })
    }
}

fn run_retrain(
    job_id: &str,
    cancel: &CancelFlag,
    store: &FeedbackStore,
    synchronizer: &DatasetSynchronizer,
    orchestrator: &TrainingOrchestrator,
    controller: &ModelSwapController,
) -> Result<RetrainReport, LifecycleError> {
    let registry = store.label_names()?;
    let corpus = synchronizer.synchronize(&registry, job_id)?;
    let trained = orchestrator.train(&corpus.root, &corpus.classes, cancel);
    synchronizer.discard(&corpus);
    let outcome = trained?;
    cancel.check().map_err(TrainingError::from)?;

    // Labels may have changed while training ran; promotion checks the
    // binding against the registry as it is now.
    let current = store.label_names()?;
    let live = controller.promote(outcome.artifact, &current)?;
    Ok(RetrainReport {
        model_id: live.model_id.clone(),
        training: outcome.report,
        mismatch: corpus.report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_map_to_statuses() {
        let unavailable =
            LifecycleError::Prediction(PredictionError::ModelUnavailable("none".to_string()));
        assert_eq!(unavailable.class(), ErrorClass::Unavailable);
        assert_eq!(unavailable.class().http_status(), 503);

        let missing = LifecycleError::Feedback(FeedbackError::Store(StoreError::LabelNotFound(
            LabelRef::Id(3),
        )));
        assert_eq!(missing.class().http_status(), 400);

        let duplicate = LifecycleError::Store(StoreError::DuplicateLabel("pizza".to_string()));
        assert_eq!(duplicate.class(), ErrorClass::Conflict);

        let stale = LifecycleError::Feedback(FeedbackError::Store(StoreError::StaleSample(9)));
        assert_eq!(stale.class().http_status(), 409);

        let training = LifecycleError::Training(TrainingError::InsufficientClasses { found: 1 });
        assert_eq!(training.class(), ErrorClass::Training);

        let promotion = LifecycleError::Promotion(PromotionError::ClassCountMismatch {
            expected: 3,
            found: 2,
        });
        assert_eq!(promotion.class().http_status(), 500);

        assert_eq!(
            LifecycleError::RetrainInProgress("job".to_string())
                .class()
                .http_status(),
            409
        );
    }
}
