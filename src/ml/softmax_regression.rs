//! Built-in softmax regression trained with mini-batch Adam.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng, seq::SliceRandom};

use super::metrics::{ConfusionMatrix, accuracy};
use super::procedure::{
    CancelFlag, ModelSeed, ProcedureError, TrainSet, TrainedWeights, TrainingProcedure,
};
use super::{EpochMetrics, Hyperparameters, softmax};

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.999;
const EPSILON: f32 = 1e-8;

/// Linear classifier over pipeline features.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftmaxRegression {
    /// L2 penalty applied to weights (not biases).
    pub l2: f32,
}

impl TrainingProcedure for SoftmaxRegression {
    fn train(
        &self,
        seed: &ModelSeed,
        train: &TrainSet,
        eval: &TrainSet,
        hyperparameters: &Hyperparameters,
        cancel: &CancelFlag,
    ) -> Result<(TrainedWeights, Vec<EpochMetrics>), ProcedureError> {
        validate_set(train, seed, "train")?;
        validate_set(eval, seed, "eval")?;
        if train.is_empty() {
            return Err(ProcedureError::InvalidInput("Empty training set".to_string()));
        }
        let classes = seed.n_classes;
        let dim = seed.input_dim;
        let mut rng = StdRng::seed_from_u64(seed.seed);
        let mut params = TrainedWeights {
            weights: (0..classes * dim)
                .map(|_| (rng.random::<f32>() - 0.5) * 0.01)
                .collect(),
            bias: vec![0.0; classes],
        };
        let mut adam = AdamState::new(classes * dim, classes);
        let mut indices: Vec<usize> = (0..train.len()).collect();
        let batch_size = hyperparameters.batch_size.max(1);
        let l2 = self.l2.max(0.0);
        let mut history = Vec::with_capacity(hyperparameters.epochs);

        for epoch in 0..hyperparameters.epochs {
            indices.shuffle(&mut rng);
            let mut loss_sum = 0.0f32;
            let mut cm = ConfusionMatrix::new(classes);
            for chunk in indices.chunks(batch_size) {
                cancel.check()?;
                let mut grad_w = vec![0.0f32; params.weights.len()];
                let mut grad_b = vec![0.0f32; classes];
                for &idx in chunk {
                    let x = &train.x[idx];
                    let y = train.y[idx];
                    let probs = forward(&params, x, classes, dim);
                    loss_sum += -probs[y].max(1e-12).ln();
                    cm.add(y, argmax(&probs));
                    for c in 0..classes {
                        let diff = probs[c] - if c == y { 1.0 } else { 0.0 };
                        let base = c * dim;
                        for i in 0..dim {
                            grad_w[base + i] += diff * x[i];
                        }
                        grad_b[c] += diff;
                    }
                }
                let inv = 1.0 / chunk.len() as f32;
                for (g, w) in grad_w.iter_mut().zip(&params.weights) {
                    *g = *g * inv + l2 * w;
                }
                for g in &mut grad_b {
                    *g *= inv;
                }
                adam.step(&mut params, &grad_w, &grad_b, hyperparameters.learning_rate);
            }
            let (eval_loss, eval_accuracy) = if eval.is_empty() {
                (None, None)
            } else {
                let (loss, acc) = evaluate(&params, eval, classes, dim);
                (Some(loss), Some(acc))
            };
            let metrics = EpochMetrics {
                epoch: epoch + 1,
                train_loss: loss_sum / train.len() as f32,
                train_accuracy: accuracy(&cm),
                eval_loss,
                eval_accuracy,
            };
            tracing::debug!(
                "Epoch {}: train loss {:.4}, train acc {:.3}, eval acc {:?}",
                metrics.epoch,
                metrics.train_loss,
                metrics.train_accuracy,
                metrics.eval_accuracy
            );
            history.push(metrics);
        }
        if params
            .weights
            .iter()
            .chain(&params.bias)
            .any(|value| !value.is_finite())
        {
            return Err(ProcedureError::Failed(
                "Weights diverged to non-finite values".to_string(),
            ));
        }
        Ok((params, history))
    }
}

struct AdamState {
    m_w: Vec<f32>,
    v_w: Vec<f32>,
    m_b: Vec<f32>,
    v_b: Vec<f32>,
    step: i32,
}

impl AdamState {
    fn new(weights: usize, bias: usize) -> Self {
        Self {
            m_w: vec![0.0; weights],
            v_w: vec![0.0; weights],
            m_b: vec![0.0; bias],
            v_b: vec![0.0; bias],
            step: 0,
        }
    }

    fn step(&mut self, params: &mut TrainedWeights, grad_w: &[f32], grad_b: &[f32], lr: f32) {
        self.step += 1;
        let correction1 = 1.0 - BETA1.powi(self.step);
        let correction2 = 1.0 - BETA2.powi(self.step);
        let update = |param: &mut f32, m: &mut f32, v: &mut f32, g: f32| {
            *m = BETA1 * *m + (1.0 - BETA1) * g;
            *v = BETA2 * *v + (1.0 - BETA2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *param -= lr * m_hat / (v_hat.sqrt() + EPSILON);
        };
        for i in 0..grad_w.len() {
            update(&mut params.weights[i], &mut self.m_w[i], &mut self.v_w[i], grad_w[i]);
        }
        for i in 0..grad_b.len() {
            update(&mut params.bias[i], &mut self.m_b[i], &mut self.v_b[i], grad_b[i]);
        }
    }
}

fn validate_set(set: &TrainSet, seed: &ModelSeed, name: &str) -> Result<(), ProcedureError> {
    if set.x.len() != set.y.len() {
        return Err(ProcedureError::InvalidInput(format!(
            "Mismatched {name} inputs/labels"
        )));
    }
    if seed.n_classes == 0 {
        return Err(ProcedureError::InvalidInput("No classes".to_string()));
    }
    if set.x.iter().any(|row| row.len() != seed.input_dim) {
        return Err(ProcedureError::InvalidInput(format!(
            "Inconsistent {name} row length (expected {})",
            seed.input_dim
        )));
    }
    if set.y.iter().any(|&y| y >= seed.n_classes) {
        return Err(ProcedureError::InvalidInput(format!(
            "{name} label out of range"
        )));
    }
    Ok(())
}

fn forward(params: &TrainedWeights, x: &[f32], classes: usize, dim: usize) -> Vec<f32> {
    let mut logits = vec![0.0f32; classes];
    for (c, logit) in logits.iter_mut().enumerate() {
        let base = c * dim;
        let mut sum = params.bias[c];
        for i in 0..dim {
            sum += params.weights[base + i] * x[i];
        }
        *logit = sum;
    }
    softmax(&logits)
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = idx;
        }
    }
    best
}

fn evaluate(params: &TrainedWeights, set: &TrainSet, classes: usize, dim: usize) -> (f32, f32) {
    let mut cm = ConfusionMatrix::new(classes);
    let mut loss = 0.0f32;
    for (x, &y) in set.x.iter().zip(&set.y) {
        let probs = forward(params, x, classes, dim);
        loss += -probs[y].max(1e-12).ln();
        cm.add(y, argmax(&probs));
    }
    (loss / set.len() as f32, accuracy(&cm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separable(n: usize) -> TrainSet {
        let mut set = TrainSet::default();
        for i in 0..n {
            let class = i % 2;
            let offset = if class == 0 { -1.0 } else { 1.0 };
            set.x.push(vec![offset + (i as f32) * 0.01, offset]);
            set.y.push(class);
        }
        set
    }

    fn seed() -> ModelSeed {
        ModelSeed {
            n_classes: 2,
            input_dim: 2,
            seed: 42,
        }
    }

    fn hyperparameters() -> Hyperparameters {
        Hyperparameters {
            batch_size: 4,
            epochs: 30,
            learning_rate: 0.05,
        }
    }

    #[test]
    fn learns_separable_data() {
        let (weights, history) = SoftmaxRegression::default()
            .train(&seed(), &separable(40), &separable(10), &hyperparameters(), &CancelFlag::new())
            .unwrap();
        assert_eq!(weights.weights.len(), 4);
        assert_eq!(weights.bias.len(), 2);
        assert_eq!(history.len(), 30);
        let last = history.last().unwrap();
        assert!(last.eval_accuracy.unwrap() > 0.9);
        assert!(last.train_loss < history[0].train_loss);
    }

    #[test]
    fn training_is_reproducible() {
        let run = || {
            SoftmaxRegression::default()
                .train(&seed(), &separable(20), &separable(6), &hyperparameters(), &CancelFlag::new())
                .unwrap()
        };
        assert_eq!(run().0, run().0);
    }

    #[test]
    fn cancelled_flag_stops_training() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = SoftmaxRegression::default()
            .train(&seed(), &separable(8), &TrainSet::default(), &hyperparameters(), &cancel)
            .unwrap_err();
        assert!(matches!(err, ProcedureError::Cancelled(_)));
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let mut set = separable(4);
        set.y[0] = 7;
        let err = SoftmaxRegression::default()
            .train(&seed(), &set, &TrainSet::default(), &hyperparameters(), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, ProcedureError::InvalidInput(_)));
    }
}
