use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::CorpusSample;

/// Train/eval partition policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitPolicy {
    pub train_fraction: f64,
    pub seed: u64,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            train_fraction: 0.8,
            seed: 42,
        }
    }
}

/// Train and eval samples for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub train: Vec<CorpusSample>,
    pub eval: Vec<CorpusSample>,
}

/// Split samples reproducibly.
///
/// Samples are put in `(class, file name)` order, shuffled with a seeded RNG,
/// and the first `floor(train_fraction * n)` (at least one) go to training.
/// Identical corpora give identical partitions regardless of where the corpus
/// directory lives.
pub fn deterministic_split(mut samples: Vec<CorpusSample>, policy: SplitPolicy) -> Partition {
    samples.sort_by(|a, b| (a.class_idx, &a.file_name).cmp(&(b.class_idx, &b.file_name)));
    let mut rng = StdRng::seed_from_u64(policy.seed);
    samples.shuffle(&mut rng);
    let n = samples.len();
    let fraction = policy.train_fraction.clamp(0.0, 1.0);
    let train_len = ((n as f64) * fraction).floor() as usize;
    let train_len = train_len.clamp(n.min(1), n);
    let eval = samples.split_off(train_len);
    Partition {
        train: samples,
        eval,
    }
}
