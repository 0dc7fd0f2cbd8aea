use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;

use super::{EpochMetrics, Hyperparameters};

/// Shape and seed of the model a procedure starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSeed {
    pub n_classes: usize,
    pub input_dim: usize,
    pub seed: u64,
}

/// Feature rows with class indices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainSet {
    pub x: Vec<Vec<f32>>,
    pub y: Vec<usize>,
}

impl TrainSet {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Row-major `n_classes x input_dim` weights plus one bias per class.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedWeights {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Error)]
pub enum ProcedureError {
    #[error("Training cancelled: {0}")]
    Cancelled(String),
    #[error("Invalid training input: {0}")]
    InvalidInput(String),
    #[error("Training failed: {0}")]
    Failed(String),
}

/// Cooperative cancellation shared between a job handle and its worker.
///
/// Trips either on an explicit [`CancelFlag::cancel`] or once the optional
/// deadline passes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Option<Instant>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.timed_out()
    }

    pub fn timed_out(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// `Err(Cancelled)` once tripped, with a reason naming the trigger.
    pub fn check(&self) -> Result<(), ProcedureError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ProcedureError::Cancelled("cancel requested".to_string()));
        }
        if self.timed_out() {
            return Err(ProcedureError::Cancelled("time limit exceeded".to_string()));
        }
        Ok(())
    }
}

/// External optimization loop.
///
/// Given a seed shape, train/eval rows and hyperparameters, returns weights
/// and per-epoch metrics. Implementations should poll `cancel` regularly.
pub trait TrainingProcedure: Send + Sync {
    fn train(
        &self,
        seed: &ModelSeed,
        train: &TrainSet,
        eval: &TrainSet,
        hyperparameters: &Hyperparameters,
        cancel: &CancelFlag,
    ) -> Result<(TrainedWeights, Vec<EpochMetrics>), ProcedureError>;
}
