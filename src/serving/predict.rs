use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feedback::{FeedbackError, FeedbackStore, LabelTarget};
use crate::ml::{ArtifactError, Prediction};
use crate::pipeline::{ImagePipeline, PipelineError};
use crate::store::{Correctness, FeedbackSample, LabelRef};

use super::ModelSwapController;

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Image is missing or empty")]
    EmptyImage,
    #[error("Image could not be processed: {0}")]
    InvalidImage(#[from] PipelineError),
    /// Nothing is live and nothing could be loaded; retry later.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    #[error(transparent)]
    Feedback(#[from] FeedbackError),
    #[error("Inference failed: {0}")]
    Inference(#[from] ArtifactError),
}

/// A prediction plus the feedback sample recorded for it, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
    pub prediction: Prediction,
    pub feedback: Option<FeedbackSample>,
}

/// Serves predictions from whatever artifact is live when a call starts.
pub struct PredictionServer {
    controller: Arc<ModelSwapController>,
    pipeline: Arc<dyn ImagePipeline>,
    store: FeedbackStore,
}

impl PredictionServer {
    pub fn new(
        controller: Arc<ModelSwapController>,
        pipeline: Arc<dyn ImagePipeline>,
        store: FeedbackStore,
    ) -> Self {
        Self {
            controller,
            pipeline,
            store,
        }
    }

    /// Classify `image`. With `ground_truth`, also store a feedback sample
    /// whose correctness is whether the prediction matched it.
    pub fn predict(
        &self,
        image: &[u8],
        ground_truth: Option<&LabelRef>,
    ) -> Result<PredictionOutcome, PredictionError> {
        if image.is_empty() {
            return Err(PredictionError::EmptyImage);
        }
        let truth = ground_truth
            .map(|label| self.store.resolve_label(label))
            .transpose()?;
        let registry = self.store.label_names()?;
        let artifact = self.controller.load_on_demand(&registry).ok_or_else(|| {
            PredictionError::ModelUnavailable(
                self.controller
                    .last_load_error()
                    .unwrap_or_else(|| "no live model".to_string()),
            )
        })?;
        let features = self.pipeline.features(image)?;
        let prediction = artifact.predict(&features)?;
        tracing::debug!(
            "Predicted {:?} ({:.3}) with model {}",
            prediction.label,
            prediction.confidence,
            prediction.model_id
        );

        let feedback = match truth {
            Some(label) => {
                let correctness = Correctness::from_bool(Some(label.name == prediction.label));
                Some(self.store.submit(
                    image,
                    &LabelTarget::Existing(LabelRef::Id(label.id)),
                    correctness,
                )?)
            }
            None => None,
        };
        Ok(PredictionOutcome {
            prediction,
            feedback,
        })
    }
}
