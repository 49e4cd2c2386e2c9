//! Index samplers for the three partitions.
//!
//! Training draws with replacement, weighting every index by the inverse
//! frequency of its class, so that classes are seen uniformly in expectation.
//! Validation and test visit every index exactly once in a seeded order.

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{FusionError, Result};

/// Per-class weight `1 / count(class)`; absent classes get weight 0.
#[must_use]
pub fn inverse_frequency_weights(labels: &[usize], num_classes: usize) -> Vec<f64> {
    let mut counts = vec![0usize; num_classes];
    for &label in labels {
        if label < num_classes {
            counts[label] += 1;
        }
    }
    counts
        .into_iter()
        .map(|count| if count == 0 { 0.0 } else { 1.0 / count as f64 })
        .collect()
}

/// Class-balanced sampler with replacement.
///
/// The RNG persists across epochs, so consecutive epochs draw different
/// index sequences while the whole run stays reproducible from the seed.
#[derive(Debug, Clone)]
pub struct WeightedClassSampler {
    distribution: WeightedIndex<f64>,
    class_weights: Vec<f64>,
    num_samples: usize,
    rng: ChaCha8Rng,
}

impl WeightedClassSampler {
    /// Build a sampler over `labels` drawing `labels.len()` indices per epoch.
    ///
    /// # Errors
    ///
    /// Fails if `labels` is empty or a label is out of range.
    pub fn new(labels: &[usize], num_classes: usize, seed: u64) -> Result<Self> {
        if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(FusionError::data(format!(
                "label {bad} out of range for {num_classes} classes"
            )));
        }
        let class_weights = inverse_frequency_weights(labels, num_classes);
        let per_index: Vec<f64> = labels.iter().map(|&l| class_weights[l]).collect();
        let distribution = WeightedIndex::new(&per_index)
            .map_err(|e| FusionError::data(format!("cannot build weighted sampler: {e}")))?;

        Ok(Self {
            distribution,
            class_weights,
            num_samples: labels.len(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Per-class sampling weights.
    #[must_use]
    pub fn class_weights(&self) -> &[f64] {
        &self.class_weights
    }

    /// Number of indices drawn per epoch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.num_samples
    }

    /// Whether the sampler draws nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    /// Draw one epoch of indices.
    pub fn epoch_indices(&mut self) -> Vec<usize> {
        (0..self.num_samples)
            .map(|_| self.distribution.sample(&mut self.rng))
            .collect()
    }
}

/// Every index once per pass, shuffled deterministically per epoch.
#[derive(Debug, Clone, Copy)]
pub struct ShuffledOrder {
    len: usize,
    seed: u64,
}

impl ShuffledOrder {
    /// Order over `len` indices.
    #[must_use]
    pub fn new(len: usize, seed: u64) -> Self {
        Self { len, seed }
    }

    /// Permutation for `epoch`.
    #[must_use]
    pub fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len).collect();
        let mix = self.seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        indices.shuffle(&mut ChaCha8Rng::seed_from_u64(mix));
        indices
    }
}

/// Sampler attached to one partition.
#[derive(Debug, Clone)]
pub enum PartitionSampler {
    /// Training partition.
    Weighted(WeightedClassSampler),
    /// Validation and test partitions.
    Shuffled(ShuffledOrder),
}

impl PartitionSampler {
    /// Indices for one pass over the partition.
    pub fn epoch_indices(&mut self, epoch: usize) -> Vec<usize> {
        match self {
            PartitionSampler::Weighted(sampler) => sampler.epoch_indices(),
            PartitionSampler::Shuffled(order) => order.epoch_indices(epoch),
        }
    }
}
