//! Model artifacts, metrics and the training-procedure seam.
//!
//! The lifecycle never looks inside weights; it only relies on
//! [`ModelArtifact`]'s explicit class binding and output dimension.

pub mod artifact;
pub mod metrics;
pub mod procedure;
pub mod softmax_regression;

pub use artifact::{ArtifactError, ModelArtifact, Prediction};
pub use metrics::EpochMetrics;
pub use procedure::{
    CancelFlag, ModelSeed, ProcedureError, TrainSet, TrainedWeights, TrainingProcedure,
};
pub use softmax_regression::SoftmaxRegression;

use serde::{Deserialize, Serialize};

/// Optimizer settings handed to a [`TrainingProcedure`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f32,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 10,
            learning_rate: 1e-4,
        }
    }
}

/// Numerically stable softmax.
pub fn softmax(raw: &[f32]) -> Vec<f32> {
    if raw.is_empty() {
        return Vec::new();
    }
    let max = raw
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, |a, b| a.max(b));
    let mut exps = Vec::with_capacity(raw.len());
    let mut sum = 0.0f32;
    for &v in raw {
        let e = (v - max).exp();
        exps.push(e);
        sum += e;
    }
    if sum == 0.0 || !sum.is_finite() {
        return vec![1.0 / raw.len() as f32; raw.len()];
    }
    for v in &mut exps {
        *v /= sum;
    }
    exps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one_and_orders() {
        let probs = softmax(&[1.0, 3.0, 2.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[1] > probs[2] && probs[2] > probs[0]);
        assert!(softmax(&[]).is_empty());
    }
}
