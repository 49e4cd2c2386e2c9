//! Classification metrics, pass summaries and best-epoch tracking.
//!
//! # Example
//!
//! ```
//! use fusion_affect_rs::metrics::{BestTracker, CheckpointDecision};
//!
//! let mut tracker = BestTracker::new();
//! assert_eq!(tracker.observe(0, 0.5), CheckpointDecision::Save);
//! assert_eq!(tracker.observe(1, 0.4), CheckpointDecision::Skip);
//! assert_eq!(tracker.best_epoch(), Some(0));
//! ```

use serde::{Deserialize, Serialize};

use crate::config::EvalIndicatorKind;

/// Square confusion matrix, `counts[label][prediction]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Empty matrix over `num_classes` classes.
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    /// Build from `(prediction, label)` pairs.
    #[must_use]
    pub fn from_pairs(num_classes: usize, pairs: &[(usize, usize)]) -> Self {
        let mut matrix = Self::new(num_classes);
        for &(prediction, label) in pairs {
            matrix.record(prediction, label);
        }
        matrix
    }

    /// Count one prediction. Out-of-range indices are ignored.
    pub fn record(&mut self, prediction: usize, label: usize) {
        if let Some(cell) = self
            .counts
            .get_mut(label)
            .and_then(|row| row.get_mut(prediction))
        {
            *cell += 1;
        }
    }

    /// Number of classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    /// Raw counts, rows are labels.
    #[must_use]
    pub fn counts(&self) -> &[Vec<usize>] {
        &self.counts
    }

    /// Total number of recorded samples.
    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    fn correct(&self) -> usize {
        (0..self.num_classes()).map(|c| self.counts[c][c]).sum()
    }

    fn support(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    fn predicted(&self, class: usize) -> usize {
        self.counts.iter().map(|row| row[class]).sum()
    }

    /// Fraction of correct predictions; 0 when empty.
    #[must_use]
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.correct() as f64 / total as f64
    }

    /// Unweighted mean of per-class F1 over classes present in labels or
    /// predictions.
    #[must_use]
    pub fn macro_f1(&self) -> f64 {
        let scores: Vec<f64> = (0..self.num_classes())
            .filter(|&c| self.support(c) + self.predicted(c) > 0)
            .map(|c| {
                let tp = self.counts[c][c] as f64;
                let denom = (self.support(c) + self.predicted(c)) as f64;
                2.0 * tp / denom
            })
            .collect();
        mean(&scores)
    }

    /// Unweighted mean of per-class recall over classes present in labels.
    #[must_use]
    pub fn balanced_accuracy(&self) -> f64 {
        let recalls: Vec<f64> = (0..self.num_classes())
            .filter(|&c| self.support(c) > 0)
            .map(|c| self.counts[c][c] as f64 / self.support(c) as f64)
            .collect();
        mean(&recalls)
    }

    /// Value of the configured evaluation indicator.
    #[must_use]
    pub fn indicator(&self, kind: EvalIndicatorKind) -> f64 {
        match kind {
            EvalIndicatorKind::MacroF1 => self.macro_f1(),
            EvalIndicatorKind::BalancedAccuracy => self.balanced_accuracy(),
            EvalIndicatorKind::Accuracy => self.accuracy(),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Result of one pass over a partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassMetrics {
    /// Sample-weighted mean loss.
    pub mean_loss: f64,
    /// Fraction of correct predictions.
    pub accuracy: f64,
    /// Confusion matrix of the pass.
    pub confusion: ConfusionMatrix,
    /// `(prediction, label)` per visited sample, in visit order.
    pub predictions: Vec<(usize, usize)>,
    /// Source row of every visited sample, aligned with `predictions`.
    pub row_ids: Vec<usize>,
    /// Validation indicator; only set on evaluation passes.
    pub eval_indicator: Option<f64>,
}

/// Running accumulator for a pass.
#[derive(Debug, Clone)]
pub struct PassAccumulator {
    loss_sum: f64,
    samples: usize,
    predictions: Vec<(usize, usize)>,
    row_ids: Vec<usize>,
    num_classes: usize,
}

impl PassAccumulator {
    /// Empty accumulator.
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        Self {
            loss_sum: 0.0,
            samples: 0,
            predictions: Vec::new(),
            row_ids: Vec::new(),
            num_classes,
        }
    }

    /// Add one batch: its mean loss and per-sample outcomes.
    pub fn add_batch(
        &mut self,
        batch_loss: f64,
        predictions: &[usize],
        labels: &[usize],
        row_ids: &[usize],
    ) {
        let n = labels.len();
        self.loss_sum += batch_loss * n as f64;
        self.samples += n;
        self.predictions
            .extend(predictions.iter().copied().zip(labels.iter().copied()));
        self.row_ids.extend_from_slice(row_ids);
    }

    /// Samples seen so far.
    #[must_use]
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Running mean loss.
    #[must_use]
    pub fn mean_loss(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.loss_sum / self.samples as f64
        }
    }

    /// Close the pass. `indicator` is computed when given.
    #[must_use]
    pub fn finish(self, indicator: Option<EvalIndicatorKind>) -> PassMetrics {
        let confusion = ConfusionMatrix::from_pairs(self.num_classes, &self.predictions);
        let mean_loss = self.mean_loss();
        PassMetrics {
            mean_loss,
            accuracy: confusion.accuracy(),
            eval_indicator: indicator.map(|kind| confusion.indicator(kind)),
            confusion,
            predictions: self.predictions,
            row_ids: self.row_ids,
        }
    }
}

/// Whether to snapshot the model after a validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDecision {
    /// New best (or first) indicator; write a checkpoint.
    Save,
    /// Not an improvement.
    Skip,
}

/// Tracks the best validation indicator of a run.
///
/// The first observation always saves; later ones save only when strictly
/// greater than every previous indicator.
#[derive(Debug, Clone, Default)]
pub struct BestTracker {
    history: Vec<f64>,
    best: Option<(usize, f64)>,
}

impl BestTracker {
    /// Fresh tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the indicator of `epoch` and decide whether to checkpoint.
    pub fn observe(&mut self, epoch: usize, indicator: f64) -> CheckpointDecision {
        self.history.push(indicator);
        match self.best {
            Some((_, best)) if indicator <= best || indicator.is_nan() => CheckpointDecision::Skip,
            _ => {
                self.best = Some((epoch, indicator));
                CheckpointDecision::Save
            }
        }
    }

    /// Epoch of the last saved checkpoint.
    #[must_use]
    pub fn best_epoch(&self) -> Option<usize> {
        self.best.map(|(epoch, _)| epoch)
    }

    /// Best indicator so far.
    #[must_use]
    pub fn best_indicator(&self) -> Option<f64> {
        self.best.map(|(_, value)| value)
    }

    /// Every observed indicator in order.
    #[must_use]
    pub fn history(&self) -> &[f64] {
        &self.history
    }
}

/// One row of the run history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Epoch index.
    pub epoch: usize,
    /// Mean training loss.
    pub train_loss: f64,
    /// Training accuracy.
    pub train_acc: f64,
    /// Mean validation loss.
    pub valid_loss: f64,
    /// Validation accuracy.
    pub valid_acc: f64,
    /// Validation indicator.
    pub eval_indicator: f64,
}
