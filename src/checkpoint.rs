//! Checkpoint and run-artifact persistence.
//!
//! Every run writes into `{output_dir}/{kind}_{modality}/`, with file names
//! prefixed by the granularity level:
//!
//! | File | Contents |
//! |------|----------|
//! | `{level}.safetensors` | best parameters |
//! | `{level}.checkpoint.json` | epoch, config tag, indicator |
//! | `{level}_acc_loss.csv` | per-epoch history |
//! | `{level}_all_pred_val.txt` / `{level}_all_label_val.txt` | final validation dumps |
//! | `{level}_test_predictions.csv` | `row_id,prediction,label` |
//! | `{level}_test_report.json` | test loss, accuracy, indicator, confusion |
//! | `{level}_scalars.jsonl` | `{"tag","step","value"}` events |

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::{EvalIndicatorKind, ExperimentConfig};
use crate::error::{FusionError, Result};
use crate::metrics::{EpochRecord, PassMetrics};

/// Metadata stored next to the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Epoch the parameters were taken from.
    pub epoch: usize,
    /// `{kind}_{modality}/{level}`.
    pub tag: String,
    /// Validation indicator at that epoch.
    pub indicator: f64,
}

/// Summary of the test pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    /// Epoch of the reloaded checkpoint.
    pub checkpoint_epoch: usize,
    /// Mean test loss.
    pub loss: f64,
    /// Test accuracy.
    pub accuracy: f64,
    /// Indicator used for checkpoint selection.
    pub indicator_kind: EvalIndicatorKind,
    /// Its value on the test partition.
    pub indicator: f64,
    /// `confusion[label][prediction]`.
    pub confusion: Vec<Vec<usize>>,
}

#[derive(Serialize)]
struct PredictionRow {
    row_id: usize,
    prediction: usize,
    label: usize,
}

#[derive(Serialize)]
struct ScalarEvent<'a> {
    tag: &'a str,
    step: usize,
    value: f64,
}

/// File layout of one `(kind, modality, level)` run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    run_dir: PathBuf,
    level: String,
    tag: String,
}

impl CheckpointStore {
    /// Store for the configured combination.
    ///
    /// # Errors
    ///
    /// Fails if the model/modality combination is invalid.
    pub fn for_config(config: &ExperimentConfig) -> Result<Self> {
        let modality = config.resolved_modality()?;
        let run_dir =
            Path::new(&config.output_dir).join(format!("{}_{}", config.model.kind, modality));
        Ok(Self {
            run_dir,
            level: config.dataset.level.as_str().to_string(),
            tag: config.run_tag()?,
        })
    }

    /// Run directory.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// `{kind}_{modality}/{level}`.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.run_dir.join(format!("{}{suffix}", self.level))
    }

    /// Path of the parameter file.
    #[must_use]
    pub fn weights_path(&self) -> PathBuf {
        self.file(".safetensors")
    }

    /// Path of the checkpoint metadata.
    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        self.file(".checkpoint.json")
    }

    /// Path of the history CSV.
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.file("_acc_loss.csv")
    }

    /// Paths of the validation prediction and label dumps.
    #[must_use]
    pub fn validation_dump_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.file("_all_pred_val.txt"),
            self.file("_all_label_val.txt"),
        )
    }

    /// Path of the per-sample test predictions.
    #[must_use]
    pub fn test_predictions_path(&self) -> PathBuf {
        self.file("_test_predictions.csv")
    }

    /// Path of the test report.
    #[must_use]
    pub fn test_report_path(&self) -> PathBuf {
        self.file("_test_report.json")
    }

    /// Path of the scalar event log.
    #[must_use]
    pub fn scalars_path(&self) -> PathBuf {
        self.file("_scalars.jsonl")
    }

    /// Path of the split assignment export.
    #[must_use]
    pub fn splits_path(&self) -> PathBuf {
        self.file("_splits.csv")
    }

    /// Create the run directory.
    ///
    /// # Errors
    ///
    /// Propagates IO errors.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.run_dir)?;
        Ok(())
    }

    /// Persist parameters and metadata, replacing any previous checkpoint.
    ///
    /// # Errors
    ///
    /// `Checkpoint` if either file cannot be written.
    pub fn save(&self, varmap: &VarMap, epoch: usize, indicator: f64) -> Result<CheckpointMeta> {
        self.prepare()?;
        let weights = self.weights_path();
        varmap.save(&weights).map_err(|e| {
            FusionError::checkpoint(format!("failed to save {}: {e}", weights.display()))
        })?;

        let meta = CheckpointMeta {
            epoch,
            tag: self.tag.clone(),
            indicator,
        };
        let json = serde_json::to_string_pretty(&meta)?;
        fs::write(self.metadata_path(), json).map_err(|e| {
            FusionError::checkpoint(format!(
                "failed to write {}: {e}",
                self.metadata_path().display()
            ))
        })?;

        tracing::info!(
            "Saved checkpoint to: {} (epoch={epoch}, indicator={indicator:.4})",
            weights.display()
        );
        Ok(meta)
    }

    /// Read the checkpoint metadata.
    ///
    /// # Errors
    ///
    /// `Checkpoint` if the file is missing or malformed.
    pub fn read_metadata(&self) -> Result<CheckpointMeta> {
        let path = self.metadata_path();
        let json = fs::read_to_string(&path).map_err(|e| {
            FusionError::checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&json).map_err(|e| {
            FusionError::checkpoint(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Load the saved parameters into `varmap`.
    ///
    /// Every variable of `varmap` must be present in the file.
    ///
    /// # Errors
    ///
    /// `Checkpoint` if the files are missing, malformed or belong to another run.
    pub fn load(&self, varmap: &mut VarMap) -> Result<CheckpointMeta> {
        let meta = self.read_metadata()?;
        if meta.tag != self.tag {
            return Err(FusionError::checkpoint(format!(
                "checkpoint belongs to '{}', expected '{}'",
                meta.tag, self.tag
            )));
        }
        let weights = self.weights_path();
        varmap.load(&weights).map_err(|e| {
            FusionError::checkpoint(format!("failed to load {}: {e}", weights.display()))
        })?;
        tracing::info!(
            "Loaded checkpoint from: {} (epoch={})",
            weights.display(),
            meta.epoch
        );
        Ok(meta)
    }

    /// Write the run history.
    ///
    /// # Errors
    ///
    /// Propagates CSV and IO errors.
    pub fn write_history(&self, records: &[EpochRecord]) -> Result<()> {
        self.prepare()?;
        let mut writer = csv::Writer::from_path(self.history_path())?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the validation prediction and label dumps.
    ///
    /// # Errors
    ///
    /// Propagates IO errors.
    pub fn write_validation_dumps(&self, metrics: &PassMetrics) -> Result<()> {
        self.prepare()?;
        let (pred_path, label_path) = self.validation_dump_paths();
        write_flat(&pred_path, metrics.predictions.iter().map(|&(p, _)| p))?;
        write_flat(&label_path, metrics.predictions.iter().map(|&(_, l)| l))?;
        Ok(())
    }

    /// Write the per-sample test predictions and the test report.
    ///
    /// # Errors
    ///
    /// Propagates CSV, JSON and IO errors.
    pub fn write_test_outputs(
        &self,
        metrics: &PassMetrics,
        kind: EvalIndicatorKind,
        checkpoint_epoch: usize,
    ) -> Result<TestReport> {
        self.prepare()?;
        let mut writer = csv::Writer::from_path(self.test_predictions_path())?;
        for (&row_id, &(prediction, label)) in metrics.row_ids.iter().zip(&metrics.predictions) {
            writer.serialize(PredictionRow {
                row_id,
                prediction,
                label,
            })?;
        }
        writer.flush()?;

        let report = TestReport {
            checkpoint_epoch,
            loss: metrics.mean_loss,
            accuracy: metrics.accuracy,
            indicator_kind: kind,
            indicator: metrics
                .eval_indicator
                .unwrap_or_else(|| metrics.confusion.indicator(kind)),
            confusion: metrics.confusion.counts().to_vec(),
        };
        fs::write(
            self.test_report_path(),
            serde_json::to_string_pretty(&report)?,
        )?;
        Ok(report)
    }

    /// Open the scalar event log, truncating any previous run's events.
    ///
    /// # Errors
    ///
    /// Propagates IO errors.
    pub fn scalar_log(&self) -> Result<ScalarLog> {
        self.prepare()?;
        let file = File::create(self.scalars_path())?;
        Ok(ScalarLog {
            writer: BufWriter::new(file),
        })
    }
}

fn write_flat(path: &Path, values: impl Iterator<Item = usize>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for value in values {
        writeln!(writer, "{:.18e}", value as f64)?;
    }
    writer.flush()?;
    Ok(())
}

/// Append-only log of `{"tag","step","value"}` lines.
pub struct ScalarLog {
    writer: BufWriter<File>,
}

impl ScalarLog {
    /// Append one event.
    ///
    /// # Errors
    ///
    /// Propagates IO and JSON errors.
    pub fn log(&mut self, tag: &str, step: usize, value: f64) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &ScalarEvent { tag, step, value })?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Append the four per-epoch scalars of `record`.
    ///
    /// # Errors
    ///
    /// Propagates IO and JSON errors.
    pub fn log_epoch(&mut self, record: &EpochRecord) -> Result<()> {
        self.log("train/loss", record.epoch, record.train_loss)?;
        self.log("train/accuracy", record.epoch, record.train_acc)?;
        self.log("valid/loss", record.epoch, record.valid_loss)?;
        self.log("valid/accuracy", record.epoch, record.valid_acc)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelKind, Modality};
    use crate::metrics::ConfusionMatrix;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CheckpointStore {
        let mut config = ExperimentConfig::from_preset("kemocon").unwrap();
        config.model.kind = ModelKind::Mlp;
        config.model.modality = Some(Modality::Eeg);
        config.output_dir = dir.path().to_string_lossy().into_owned();
        CheckpointStore::for_config(&config).unwrap()
    }

    fn metrics() -> PassMetrics {
        let predictions = vec![(0, 0), (1, 0), (1, 1)];
        PassMetrics {
            mean_loss: 0.5,
            accuracy: 2.0 / 3.0,
            confusion: ConfusionMatrix::from_pairs(2, &predictions),
            predictions,
            row_ids: vec![4, 9, 2],
            eval_indicator: Some(0.6),
        }
    }

    #[test]
    fn test_layout() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.run_dir(), dir.path().join("MLP_eeg"));
        assert_eq!(store.tag(), "MLP_eeg/sentence");
        assert_eq!(
            store.weights_path(),
            dir.path().join("MLP_eeg").join("sentence.safetensors")
        );
        assert!(store
            .history_path()
            .ends_with("MLP_eeg/sentence_acc_loss.csv"));
    }

    #[test]
    fn test_save_and_load_restores_parameters() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints((2, 3), "w", Init::Const(1.5)).unwrap();
        store.save(&varmap, 3, 0.75).unwrap();

        let mut fresh = VarMap::new();
        let vb = VarBuilder::from_varmap(&fresh, DType::F32, &Device::Cpu);
        let zeros = vb.get_with_hints((2, 3), "w", Init::Const(0.0)).unwrap();
        assert_eq!(zeros.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);

        let meta = store.load(&mut fresh).unwrap();
        assert_eq!(meta.epoch, 3);
        assert_eq!(meta.tag, "MLP_eeg/sentence");
        let restored: Tensor = fresh.data().lock().unwrap()["w"].as_tensor().clone();
        assert_eq!(
            restored.to_vec2::<f32>().unwrap(),
            w.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_load_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut varmap = VarMap::new();
        let err = store(&dir).load(&mut varmap).unwrap_err();
        assert!(matches!(err, FusionError::Checkpoint(_)));
    }

    #[test]
    fn test_history_csv() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let records: Vec<EpochRecord> = (0..2)
            .map(|epoch| EpochRecord {
                epoch,
                train_loss: 1.0,
                train_acc: 0.5,
                valid_loss: 0.9,
                valid_acc: 0.6,
                eval_indicator: 0.55,
            })
            .collect();
        store.write_history(&records).unwrap();

        let text = fs::read_to_string(store.history_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "epoch,train_loss,train_acc,valid_loss,valid_acc,eval_indicator"
        );
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_validation_dumps() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.write_validation_dumps(&metrics()).unwrap();

        let (pred, label) = store.validation_dump_paths();
        let preds: Vec<f64> = fs::read_to_string(pred)
            .unwrap()
            .lines()
            .map(|l| l.parse().unwrap())
            .collect();
        let labels = fs::read_to_string(label).unwrap();
        assert_eq!(preds, vec![0.0, 1.0, 1.0]);
        assert_eq!(labels.lines().count(), 3);
        assert!(labels.starts_with("0.000000000000000000e0"));
    }

    #[test]
    fn test_test_outputs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let report = store
            .write_test_outputs(&metrics(), EvalIndicatorKind::MacroF1, 1)
            .unwrap();
        assert_eq!(report.indicator, 0.6);
        assert_eq!(report.confusion, vec![vec![1, 1], vec![0, 1]]);

        let csv = fs::read_to_string(store.test_predictions_path()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "row_id,prediction,label");
        assert_eq!(lines[2], "9,1,0");

        let json = fs::read_to_string(store.test_report_path()).unwrap();
        let parsed: TestReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_scalar_log_lines() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut log = store.scalar_log().unwrap();
        log.log_epoch(&EpochRecord {
            epoch: 0,
            train_loss: 1.0,
            train_acc: 0.5,
            valid_loss: 0.9,
            valid_acc: 0.6,
            eval_indicator: 0.55,
        })
        .unwrap();
        drop(log);

        let text = fs::read_to_string(store.scalars_path()).unwrap();
        let events: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0]["tag"], "train/loss");
        assert_eq!(events[3]["value"], 0.6);
    }
}
