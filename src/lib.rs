//! # fusion-affect-rs
//!
//! Text/EEG affect classification with modality fusion, on candle.
//!
//! A run reads a preprocessed table of aligned text and EEG features, embeds
//! the text, splits and rebalances the rows, then trains one of nine model
//! kinds and keeps the checkpoint with the best validation indicator.
//!
//! ## Features
//!
//! - **Single-modality baselines** - transformer, biLSTM, MLP and resnet
//!   classifiers over text or EEG
//! - **Fusion** - both branches joined by a shared head, optionally
//!   regularized by canonical correlation or Wasserstein distance
//! - **Alignment** - two classifiers whose latents are pulled together
//! - **YAML Configuration** - presets for KEmoCon and ZuCo, CLI overrides
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a sample configuration
//! fusion-affect init config.yaml --dataset ZuCo
//!
//! # Check a model/modality combination
//! fusion-affect validate --config config.yaml --model CCA_fusion --modality fusion
//!
//! # Train
//! fusion-affect train --config config.yaml --model MLP --modality eeg
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use fusion_affect_rs::{ExperimentConfig, Trainer};
//!
//! # fn main() -> fusion_affect_rs::Result<()> {
//! let mut config = ExperimentConfig::from_preset("zuco-sa")?;
//! config.training.epochs = 5;
//!
//! let mut trainer = Trainer::new(config)?;
//! let summary = trainer.run()?;
//! println!("best epoch: {}", summary.best_epoch);
//! # Ok(())
//! # }
//! ```
//!
//! ## Objectives
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use fusion_affect_rs::config::{ObjectiveConfig, ObjectiveKind};
//! use fusion_affect_rs::objectives::PairObjective;
//!
//! # fn main() -> fusion_affect_rs::Result<()> {
//! let a = Tensor::randn(0f32, 1.0, (16, 4), &Device::Cpu)?;
//! let wd = PairObjective::from_config(ObjectiveKind::Wasserstein, &ObjectiveConfig::default());
//! let loss = wd.loss(&a, &a)?.to_scalar::<f32>()?;
//! assert!(loss.abs() < 1e-6);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod embeddings;
pub mod encoders;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod norm;
pub mod objectives;
pub mod optimizer;
pub mod sampler;
pub mod scheduler;
pub mod strategy;
pub mod trainer;

pub use checkpoint::{CheckpointMeta, CheckpointStore, TestReport};
pub use config::{ExperimentConfig, ModelKind, Modality, RunSelection, TrainingConfig};
pub use dataset::{DatasetBuilder, DatasetSplits, RawTable};
pub use embeddings::EmbeddingProvider;
pub use error::{FusionError, Result};
pub use metrics::{BestTracker, PassMetrics};
pub use trainer::{RunSummary, Trainer};
