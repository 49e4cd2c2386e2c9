//! Training/evaluation engine.
//!
//! A run moves through `Init -> (Train -> Validate -> checkpoint decision) x
//! epochs -> Test`. The test pass reloads the best checkpoint first. Any
//! batch failure aborts the run.

use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::{CheckpointStore, ScalarLog, TestReport};
use crate::config::{EvalIndicatorKind, ExperimentConfig};
use crate::dataset::{DatasetBuilder, DatasetSplits, Partition};
use crate::embeddings::build_provider;
use crate::error::{FusionError, Result};
use crate::loader::BatchLoader;
use crate::metrics::{BestTracker, CheckpointDecision, EpochRecord, PassAccumulator, PassMetrics};
use crate::model::select_model;
use crate::optimizer::{OptimizerConfig, ScheduledOptimizer};
use crate::sampler::{PartitionSampler, ShuffledOrder, WeightedClassSampler};
use crate::scheduler::SchedulerType;
use crate::strategy::{build_strategy, TrainingStrategy};

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One record per epoch.
    pub history: Vec<EpochRecord>,
    /// Epoch of the reloaded checkpoint.
    pub best_epoch: usize,
    /// Validation indicator at that epoch.
    pub best_indicator: f64,
    /// Test pass on the reloaded checkpoint.
    pub test: TestReport,
}

/// Whether a pass updates parameters.
enum PassMode<'a> {
    Train(&'a mut ScheduledOptimizer),
    Evaluate,
}

/// Drives one experiment.
///
/// # Example
///
/// ```no_run
/// use fusion_affect_rs::{ExperimentConfig, Trainer};
///
/// # fn main() -> fusion_affect_rs::Result<()> {
/// let config = ExperimentConfig::from_file("config.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// let summary = trainer.run()?;
/// println!("test accuracy: {:.3}", summary.test.accuracy);
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: ExperimentConfig,
    device: Device,
    varmap: VarMap,
    store: CheckpointStore,
    tracker: BestTracker,
    history: Vec<EpochRecord>,
}

impl Trainer {
    /// Validate `config` and pick the device.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before any data is read.
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        let store = CheckpointStore::for_config(&config)?;
        Ok(Self {
            device: select_device(),
            config,
            varmap: VarMap::new(),
            store,
            tracker: BestTracker::new(),
            history: Vec::new(),
        })
    }

    /// Configuration of this run.
    #[must_use]
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Device the model runs on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Artifact layout of this run.
    #[must_use]
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Model parameters; after a run, those of the reloaded checkpoint.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Per-epoch history so far.
    #[must_use]
    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    /// Read the configured table, embed it and run.
    ///
    /// # Errors
    ///
    /// Propagates data, embedding, numerical and checkpoint errors.
    pub fn run(&mut self) -> Result<RunSummary> {
        let provider = build_provider(&self.config.embedding)?;
        let splits =
            DatasetBuilder::new(&self.config.dataset, provider.as_ref(), self.config.seed).build()?;
        self.run_with_splits(splits)
    }

    /// Train, validate and test on prepared splits.
    ///
    /// # Errors
    ///
    /// Propagates numerical and checkpoint errors.
    pub fn run_with_splits(&mut self, splits: DatasetSplits) -> Result<RunSummary> {
        let config = self.config.clone();
        let training = &config.training;
        let indicator = training.eval_indicator;
        tracing::info!("Starting run {}", self.store.tag());
        tracing::info!("  {}", config.describe());
        tracing::info!("  Epochs: {}", training.epochs);
        tracing::info!("  Batch size: {}", training.batch_size);

        self.store.prepare()?;
        if config.dataset.export_splits {
            splits.assignment.export_csv(self.store.splits_path())?;
        }

        self.varmap = VarMap::new();
        self.tracker = BestTracker::new();
        self.history.clear();

        let vb = VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device);
        let model = select_model(
            &config,
            splits.text_dim,
            splits.signal_dim,
            splits.num_classes,
            vb,
        )?;
        let family = model.family_name();
        let strategy = build_strategy(model, &config);
        let param_count: usize = self.varmap.all_vars().iter().map(|v| v.elem_count()).sum();

        let mut optimizer = OptimizerConfig::from(training).build_scheduled(
            &self.varmap,
            SchedulerType::from_config(training, config.model.architecture.d_model),
        )?;
        tracing::info!(
            "Initialized {family} model ({} strategy), {param_count} parameters",
            strategy.name()
        );

        let num_classes = splits.num_classes;
        let loader = |partition: Partition| {
            BatchLoader::new(
                Arc::new(splits.partition(partition).clone()),
                training,
                self.device.clone(),
            )
        };
        let train_loader = loader(Partition::Train);
        let valid_loader = loader(Partition::Validation);
        let test_loader = loader(Partition::Test);

        let mut train_sampler = PartitionSampler::Weighted(WeightedClassSampler::new(
            &splits.train.labels(),
            num_classes,
            config.seed,
        )?);
        let mut valid_sampler = PartitionSampler::Shuffled(ShuffledOrder::new(
            splits.validation.len(),
            config.seed.wrapping_add(1),
        ));
        let mut test_sampler = PartitionSampler::Shuffled(ShuffledOrder::new(
            splits.test.len(),
            config.seed.wrapping_add(2),
        ));

        let mut scalars = self.store.scalar_log()?;
        let mut last_validation = None;

        for epoch in 0..training.epochs {
            tracing::info!("Starting epoch {}/{}", epoch + 1, training.epochs);

            let train = run_pass(
                strategy.as_ref(),
                &train_loader,
                train_sampler.epoch_indices(epoch),
                PassMode::Train(&mut optimizer),
                num_classes,
                None,
                self.progress_bar("train", epoch, &train_loader, splits.train.len())?,
            )?;
            let valid = run_pass(
                strategy.as_ref(),
                &valid_loader,
                valid_sampler.epoch_indices(epoch),
                PassMode::Evaluate,
                num_classes,
                Some(indicator),
                self.progress_bar("valid", epoch, &valid_loader, splits.validation.len())?,
            )?;

            let value = valid
                .eval_indicator
                .unwrap_or_else(|| valid.confusion.indicator(indicator));
            let record = EpochRecord {
                epoch,
                train_loss: train.mean_loss,
                train_acc: train.accuracy,
                valid_loss: valid.mean_loss,
                valid_acc: valid.accuracy,
                eval_indicator: value,
            };
            tracing::info!(
                "Epoch {}: train_loss={:.4} train_acc={:.4} valid_loss={:.4} valid_acc={:.4} {}={:.4} lr={:.3e}",
                epoch + 1,
                record.train_loss,
                record.train_acc,
                record.valid_loss,
                record.valid_acc,
                indicator_name(indicator),
                value,
                optimizer.learning_rate()
            );

            if self.tracker.observe(epoch, value) == CheckpointDecision::Save {
                self.store.save(&self.varmap, epoch, value)?;
            }
            self.record_epoch(record, &mut scalars)?;
            last_validation = Some(valid);
        }

        if let Some(valid) = &last_validation {
            self.store.write_validation_dumps(valid)?;
        }

        let meta = self.store.load(&mut self.varmap)?;
        let test = run_pass(
            strategy.as_ref(),
            &test_loader,
            test_sampler.epoch_indices(0),
            PassMode::Evaluate,
            num_classes,
            Some(indicator),
            self.progress_bar("test", meta.epoch, &test_loader, splits.test.len())?,
        )?;
        let report = self.store.write_test_outputs(&test, indicator, meta.epoch)?;
        tracing::info!(
            "Test (epoch {} checkpoint): loss={:.4} accuracy={:.4} {}={:.4}",
            meta.epoch + 1,
            report.loss,
            report.accuracy,
            indicator_name(indicator),
            report.indicator
        );

        Ok(RunSummary {
            history: self.history.clone(),
            best_epoch: meta.epoch,
            best_indicator: meta.indicator,
            test: report,
        })
    }

    fn record_epoch(&mut self, record: EpochRecord, scalars: &mut ScalarLog) -> Result<()> {
        scalars.log_epoch(&record)?;
        self.history.push(record);
        self.store.write_history(&self.history)
    }

    fn progress_bar(
        &self,
        pass: &str,
        epoch: usize,
        loader: &BatchLoader,
        samples: usize,
    ) -> Result<ProgressBar> {
        if !self.config.training.progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(loader.num_batches(samples) as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_prefix(format!("{pass} {}", epoch + 1));
        Ok(pb)
    }
}

fn indicator_name(kind: EvalIndicatorKind) -> &'static str {
    match kind {
        EvalIndicatorKind::MacroF1 => "macro_f1",
        EvalIndicatorKind::BalancedAccuracy => "balanced_accuracy",
        EvalIndicatorKind::Accuracy => "accuracy",
    }
}

/// One pass over `indices`. Only training passes call backward.
fn run_pass(
    strategy: &dyn TrainingStrategy,
    loader: &BatchLoader,
    indices: Vec<usize>,
    mut mode: PassMode<'_>,
    num_classes: usize,
    indicator: Option<EvalIndicatorKind>,
    pb: ProgressBar,
) -> Result<PassMetrics> {
    let train = matches!(mode, PassMode::Train(_));
    let mut acc = PassAccumulator::new(num_classes);

    for (batch_idx, batch) in loader.batches(indices).enumerate() {
        let batch = batch?;
        let output = strategy
            .forward_batch(&batch, train)
            .map_err(|e| e.at_batch(batch_idx))?;
        let loss = strategy
            .compute_loss(&output, &batch)
            .map_err(|e| e.at_batch(batch_idx))?;

        let loss_value = loss.total.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        if !loss_value.is_finite() {
            pb.abandon();
            return Err(FusionError::numerical(
                batch_idx,
                format!("{} loss is {loss_value}", strategy.name()),
            ));
        }

        let predictions = output.predictions()?;
        if let PassMode::Train(optimizer) = &mut mode {
            strategy.step(&loss, optimizer)?;
        }
        acc.add_batch(loss_value, &predictions, &batch.label_ids, &batch.row_ids);

        pb.set_message(format!("loss {:.4}", acc.mean_loss()));
        pb.inc(1);
    }
    pb.finish_and_clear();
    Ok(acc.finish(indicator))
}

/// Pick the training device.
///
/// CUDA when the `cuda` feature is enabled and a device is available, unless
/// `FUSION_FORCE_CPU=1`. `FUSION_CUDA_DEVICE` selects the ordinal.
fn select_device() -> Device {
    let force_cpu = std::env::var("FUSION_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("FUSION_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if !force_cpu && cfg!(feature = "cuda") {
        match Device::cuda_if_available(cuda_device) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device {cuda_device})");
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                Device::Cpu
            }
        }
    } else {
        if force_cpu {
            tracing::info!("CPU mode forced via FUSION_FORCE_CPU");
        } else {
            tracing::debug!("CUDA feature disabled; training on CPU");
        }
        Device::Cpu
    }
}
