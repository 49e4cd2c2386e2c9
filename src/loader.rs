//! Batch collation with optional background prefetching.
//!
//! With `num_workers == 0` batches are collated on the caller's thread. With
//! `num_workers > 0` one prefetch thread collates ahead into a bounded
//! channel of `prefetch_factor` batches. Batches always arrive in index order.

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use candle_core::{Device, Tensor};

use crate::config::TrainingConfig;
use crate::dataset::{Dataset, Sample};
use crate::error::{FusionError, Result};

/// A collated batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Text embeddings `[batch, text_dim]`.
    pub text: Tensor,
    /// Signal vectors `[batch, signal_dim]`.
    pub signal: Tensor,
    /// Class indices `[batch]` (u32).
    pub labels: Tensor,
    /// Class indices on the host.
    pub label_ids: Vec<usize>,
    /// Source rows.
    pub row_ids: Vec<usize>,
}

impl Batch {
    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.row_ids.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }
}

/// Stack samples into a [`Batch`].
///
/// # Errors
///
/// Fails on an empty slice or samples of unequal width.
pub fn collate(samples: &[&Sample], device: &Device) -> Result<Batch> {
    let first = samples
        .first()
        .ok_or_else(|| FusionError::data("cannot collate an empty batch"))?;
    let (text_dim, signal_dim) = (first.text.len(), first.signal.len());
    let n = samples.len();

    let mut text = Vec::with_capacity(n * text_dim);
    let mut signal = Vec::with_capacity(n * signal_dim);
    let mut label_ids = Vec::with_capacity(n);
    let mut row_ids = Vec::with_capacity(n);
    for sample in samples {
        if sample.text.len() != text_dim || sample.signal.len() != signal_dim {
            return Err(FusionError::data(format!(
                "row {} has widths ({}, {}), expected ({text_dim}, {signal_dim})",
                sample.row_id,
                sample.text.len(),
                sample.signal.len()
            )));
        }
        text.extend_from_slice(&sample.text);
        signal.extend_from_slice(&sample.signal);
        label_ids.push(sample.label);
        row_ids.push(sample.row_id);
    }
    let labels: Vec<u32> = label_ids.iter().map(|&l| l as u32).collect();

    Ok(Batch {
        text: Tensor::from_vec(text, (n, text_dim), device)?,
        signal: Tensor::from_vec(signal, (n, signal_dim), device)?,
        labels: Tensor::from_vec(labels, n, device)?,
        label_ids,
        row_ids,
    })
}

/// Loader over one partition.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    dataset: Arc<Dataset>,
    batch_size: usize,
    num_workers: usize,
    prefetch_factor: usize,
    device: Device,
}

impl BatchLoader {
    /// Loader over `dataset` with the training configuration's batching.
    #[must_use]
    pub fn new(dataset: Arc<Dataset>, training: &TrainingConfig, device: Device) -> Self {
        Self {
            dataset,
            batch_size: training.batch_size.max(1),
            num_workers: training.num_workers,
            prefetch_factor: training.prefetch_factor.max(1),
            device,
        }
    }

    /// Underlying dataset.
    #[must_use]
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Number of batches for `n` indices.
    #[must_use]
    pub fn num_batches(&self, n: usize) -> usize {
        n.div_ceil(self.batch_size)
    }

    /// Iterate batches over `indices`, in order.
    #[must_use]
    pub fn batches(&self, indices: Vec<usize>) -> BatchIter {
        let chunks: Vec<Vec<usize>> = indices
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();

        if self.num_workers == 0 {
            return BatchIter::Inline {
                dataset: Arc::clone(&self.dataset),
                device: self.device.clone(),
                chunks: chunks.into_iter(),
            };
        }

        let (tx, rx) = mpsc::sync_channel(self.prefetch_factor);
        let dataset = Arc::clone(&self.dataset);
        let device = self.device.clone();
        let handle = thread::spawn(move || {
            for chunk in chunks {
                let batch = collate_indices(&dataset, &chunk, &device);
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    break;
                }
            }
        });

        BatchIter::Prefetch {
            rx: Some(rx),
            handle: Some(handle),
        }
    }
}

fn collate_indices(dataset: &Dataset, indices: &[usize], device: &Device) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&i| {
            dataset
                .get(i)
                .ok_or_else(|| FusionError::data(format!("sample index {i} out of range")))
        })
        .collect::<Result<Vec<&Sample>>>()?;
    collate(&samples, device)
}

/// Iterator over the batches of one pass.
pub enum BatchIter {
    /// Collates on the calling thread.
    Inline {
        /// Source dataset.
        dataset: Arc<Dataset>,
        /// Target device.
        device: Device,
        /// Remaining index chunks.
        chunks: std::vec::IntoIter<Vec<usize>>,
    },
    /// Receives batches from a prefetch thread.
    Prefetch {
        /// Bounded channel of collated batches.
        rx: Option<Receiver<Result<Batch>>>,
        /// Prefetch thread.
        handle: Option<JoinHandle<()>>,
    },
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            BatchIter::Inline {
                dataset,
                device,
                chunks,
            } => chunks
                .next()
                .map(|chunk| collate_indices(dataset, &chunk, device)),
            BatchIter::Prefetch { rx, .. } => rx.as_ref().and_then(|rx| rx.recv().ok()),
        }
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        if let BatchIter::Prefetch { rx, handle } = self {
            // Unblock a sender waiting on a full channel before joining.
            drop(rx.take());
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}
