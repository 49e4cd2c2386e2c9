//! Dataset loading, splitting and sample assembly.
//!
//! The builder reads one labeled CSV table, splits its rows into
//! train/validation/test by label, oversamples the training rows until every
//! class has the majority count, embeds each partition's texts with a single
//! provider call, and joins text embeddings, signal vectors and labels by
//! row id.
//!
//! # Example
//!
//! ```no_run
//! use fusion_affect_rs::config::ExperimentConfig;
//! use fusion_affect_rs::dataset::DatasetBuilder;
//! use fusion_affect_rs::embeddings::HashingEmbeddings;
//!
//! # fn main() -> fusion_affect_rs::Result<()> {
//! let config = ExperimentConfig::from_preset("kemocon")?;
//! let provider = HashingEmbeddings::new(config.embedding.dim);
//! let splits = DatasetBuilder::new(&config.dataset, &provider, config.seed).build()?;
//! println!("{} training samples", splits.train.len());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::Read;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::DatasetConfig;
use crate::embeddings::EmbeddingProvider;
use crate::error::{FusionError, Result};

/// One training/evaluation example.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Index of the source row in the raw table.
    pub row_id: usize,
    /// Text embedding.
    pub text: Vec<f32>,
    /// Signal vector.
    pub signal: Vec<f32>,
    /// Encoded class index.
    pub label: usize,
}

/// Ordered, immutable collection of samples.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    /// Wrap samples.
    #[must_use]
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the dataset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    /// All samples.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Labels in sample order.
    #[must_use]
    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.label).collect()
    }

    /// Distinct row ids, ascending.
    #[must_use]
    pub fn unique_row_ids(&self) -> BTreeSet<usize> {
        self.samples.iter().map(|s| s.row_id).collect()
    }
}

/// Partition a row is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// Training rows.
    Train,
    /// Validation rows.
    Validation,
    /// Test rows.
    Test,
}

impl Partition {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Validation => "validation",
            Partition::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw table after column resolution.
#[derive(Debug, Clone)]
pub struct RawTable {
    texts: Vec<String>,
    signals: Vec<Vec<f32>>,
    labels: Vec<f64>,
    signal_columns: Vec<String>,
}

impl RawTable {
    /// Read the table at `path`.
    ///
    /// # Errors
    ///
    /// See [`RawTable::from_reader`].
    pub fn from_path<P: AsRef<Path>>(path: P, config: &DatasetConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            FusionError::data(format!("cannot open table {}: {e}", path.display()))
        })?;
        Self::from_reader(file, config)
    }

    /// Read a CSV table with a header row.
    ///
    /// # Errors
    ///
    /// `Config` when the label, text or a requested signal column is absent;
    /// `Data` for ragged rows, non-numeric cells or an empty table.
    pub fn from_reader<R: Read>(reader: R, config: &DatasetConfig) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        let find = |name: &str| headers.iter().position(|h| h == name);
        let label_name = config.resolved_label_column();
        let label_col = find(&label_name).ok_or_else(|| {
            FusionError::config(format!("label column '{label_name}' not found in table"))
        })?;
        let text_col = find(&config.text_column).ok_or_else(|| {
            FusionError::config(format!(
                "text column '{}' not found in table",
                config.text_column
            ))
        })?;

        let signal_cols: Vec<usize> = match &config.signal_columns {
            Some(names) => names
                .iter()
                .map(|name| {
                    find(name).ok_or_else(|| {
                        FusionError::config(format!("signal column '{name}' not found in table"))
                    })
                })
                .collect::<Result<_>>()?,
            None => (0..headers.len())
                .filter(|&i| i != label_col && i != text_col && !is_index_column(&headers[i]))
                .collect(),
        };
        if signal_cols.is_empty() {
            return Err(FusionError::config("table has no signal columns"));
        }

        let mut texts = Vec::new();
        let mut signals = Vec::new();
        let mut labels = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() != headers.len() {
                return Err(FusionError::data(format!(
                    "row {row} has {} fields, expected {}",
                    record.len(),
                    headers.len()
                )));
            }
            let label = parse_cell(&record[label_col], row, &label_name)?;
            let signal = signal_cols
                .iter()
                .map(|&c| parse_cell(&record[c], row, &headers[c]).map(|v| v as f32))
                .collect::<Result<Vec<f32>>>()?;
            texts.push(record[text_col].to_string());
            signals.push(signal);
            labels.push(label);
        }

        if labels.is_empty() {
            return Err(FusionError::data("table contains no rows"));
        }

        Ok(Self {
            texts,
            signals,
            labels,
            signal_columns: signal_cols.iter().map(|&c| headers[c].clone()).collect(),
        })
    }

    /// Build a table from columns. Row ids are positions.
    ///
    /// # Errors
    ///
    /// `Data` when the columns differ in length or signal rows differ in width.
    pub fn from_columns(
        texts: Vec<String>,
        signals: Vec<Vec<f32>>,
        labels: Vec<f64>,
    ) -> Result<Self> {
        if texts.len() != signals.len() || texts.len() != labels.len() {
            return Err(FusionError::data("text, signal and label columns differ in length"));
        }
        if labels.is_empty() {
            return Err(FusionError::data("table contains no rows"));
        }
        let width = signals[0].len();
        if let Some(row) = signals.iter().position(|s| s.len() != width) {
            return Err(FusionError::data(format!(
                "row {row} has {} signal values, expected {width}",
                signals[row].len()
            )));
        }
        Ok(Self {
            texts,
            signals,
            labels,
            signal_columns: (0..width).map(|i| format!("s{i}")).collect(),
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Signal width.
    #[must_use]
    pub fn signal_dim(&self) -> usize {
        self.signal_columns.len()
    }

    /// Names of the signal columns.
    #[must_use]
    pub fn signal_columns(&self) -> &[String] {
        &self.signal_columns
    }
}

fn is_index_column(name: &str) -> bool {
    name.is_empty() || name.starts_with("Unnamed")
}

fn parse_cell(cell: &str, row: usize, column: &str) -> Result<f64> {
    cell.trim().parse::<f64>().map_err(|_| {
        FusionError::data(format!("row {row}, column '{column}': '{cell}' is not numeric"))
    })
}

/// Maps raw label values to `0..K` in ascending value order.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelEncoder {
    classes: Vec<f64>,
}

impl LabelEncoder {
    /// Learn the sorted distinct values of `raw`.
    #[must_use]
    pub fn fit(raw: &[f64]) -> Self {
        let mut classes = raw.to_vec();
        classes.sort_by(f64::total_cmp);
        classes.dedup();
        Self { classes }
    }

    /// Distinct raw values; position is the encoded class.
    #[must_use]
    pub fn classes(&self) -> &[f64] {
        &self.classes
    }

    /// Encode one value.
    #[must_use]
    pub fn encode(&self, value: f64) -> Option<usize> {
        self.classes
            .binary_search_by(|probe| probe.total_cmp(&value))
            .ok()
    }
}

/// Row ids of each partition. Training ids include oversampling duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitAssignment {
    /// Oversampled, shuffled training row ids.
    pub train: Vec<usize>,
    /// Validation row ids.
    pub validation: Vec<usize>,
    /// Test row ids.
    pub test: Vec<usize>,
}

impl SplitAssignment {
    /// Row ids of `partition`.
    #[must_use]
    pub fn rows(&self, partition: Partition) -> &[usize] {
        match partition {
            Partition::Train => &self.train,
            Partition::Validation => &self.validation,
            Partition::Test => &self.test,
        }
    }

    /// `(row_id, partition)` for every distinct row, ordered by row id.
    #[must_use]
    pub fn unique_assignment(&self) -> Vec<(usize, Partition)> {
        let partitions = [Partition::Train, Partition::Validation, Partition::Test];
        let mut rows: Vec<(usize, Partition)> = partitions
            .into_iter()
            .flat_map(|p| {
                self.rows(p)
                    .iter()
                    .copied()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .map(move |id| (id, p))
            })
            .collect();
        rows.sort_unstable_by_key(|&(id, _)| id);
        rows
    }

    /// Write the assignment as `row_id,partition` CSV.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be written.
    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["row_id", "partition"])?;
        for (row_id, partition) in self.unique_assignment() {
            writer.write_record([row_id.to_string(), partition.as_str().to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Stratified split, oversampling and shuffling of encoded labels.
///
/// Per class the rows are shuffled and `round(n_c * holdout_ratio)` are held
/// out, leaving at least one row in train. The holdout is split evenly into
/// validation and test, per class. Minority classes in train are topped up
/// with replacement to the majority count.
#[must_use]
pub fn split_rows(
    labels: &[usize],
    num_classes: usize,
    holdout_ratio: f32,
    seed: u64,
) -> SplitAssignment {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
    for (row, &label) in labels.iter().enumerate() {
        by_class[label].push(row);
    }

    let mut train_by_class = Vec::with_capacity(num_classes);
    let mut assignment = SplitAssignment::default();
    for mut rows in by_class {
        rows.shuffle(&mut rng);
        let n = rows.len();
        let held = if n <= 1 {
            0
        } else {
            ((n as f64 * f64::from(holdout_ratio)).round() as usize).min(n - 1)
        };
        let holdout = rows.split_off(n - held);
        let n_val = holdout.len() / 2;
        assignment.validation.extend_from_slice(&holdout[..n_val]);
        assignment.test.extend_from_slice(&holdout[n_val..]);
        train_by_class.push(rows);
    }

    let majority = train_by_class.iter().map(Vec::len).max().unwrap_or(0);
    for rows in &train_by_class {
        assignment.train.extend_from_slice(rows);
        if rows.is_empty() {
            continue;
        }
        for _ in rows.len()..majority {
            assignment.train.push(rows[rng.gen_range(0..rows.len())]);
        }
    }
    assignment.train.shuffle(&mut rng);
    assignment
}

/// The three partitions of a run plus their shared metadata.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    /// Training samples (oversampled).
    pub train: Dataset,
    /// Validation samples.
    pub validation: Dataset,
    /// Test samples.
    pub test: Dataset,
    /// Number of encoded classes.
    pub num_classes: usize,
    /// Raw label value of every class index.
    pub class_values: Vec<f64>,
    /// Text embedding width.
    pub text_dim: usize,
    /// Signal width.
    pub signal_dim: usize,
    /// Row ids per partition.
    pub assignment: SplitAssignment,
}

impl DatasetSplits {
    /// Partition by name.
    #[must_use]
    pub fn partition(&self, partition: Partition) -> &Dataset {
        match partition {
            Partition::Train => &self.train,
            Partition::Validation => &self.validation,
            Partition::Test => &self.test,
        }
    }
}

/// Builds [`DatasetSplits`] from a table and an embedding provider.
pub struct DatasetBuilder<'a> {
    config: &'a DatasetConfig,
    provider: &'a dyn EmbeddingProvider,
    seed: u64,
}

impl<'a> DatasetBuilder<'a> {
    /// Builder for `config`, embedding texts with `provider`.
    #[must_use]
    pub fn new(config: &'a DatasetConfig, provider: &'a dyn EmbeddingProvider, seed: u64) -> Self {
        Self {
            config,
            provider,
            seed,
        }
    }

    /// Read the configured table and build the splits.
    ///
    /// # Errors
    ///
    /// Propagates table, split and embedding errors.
    pub fn build(&self) -> Result<DatasetSplits> {
        let path = self.config.resolved_path();
        tracing::info!("Loading table from {}", path.display());
        let table = RawTable::from_path(&path, self.config)?;
        self.build_from_table(&table)
    }

    /// Build the splits from an already loaded table.
    ///
    /// # Errors
    ///
    /// `Data` for a single-class table or a provider returning the wrong shape.
    pub fn build_from_table(&self, table: &RawTable) -> Result<DatasetSplits> {
        let encoder = LabelEncoder::fit(&table.labels);
        let num_classes = encoder.classes().len();
        if num_classes < 2 {
            return Err(FusionError::data(format!(
                "table has {num_classes} distinct label value(s); need at least 2"
            )));
        }
        let labels: Vec<usize> = table
            .labels
            .iter()
            .map(|&v| encoder.encode(v).unwrap_or_default())
            .collect();

        let assignment = split_rows(&labels, num_classes, self.config.holdout_ratio, self.seed);
        tracing::info!(
            "Split {} rows: {} train (oversampled), {} validation, {} test",
            table.len(),
            assignment.train.len(),
            assignment.validation.len(),
            assignment.test.len()
        );

        let assemble = |partition: Partition| -> Result<Dataset> {
            let rows = assignment.rows(partition);
            let embeddings = self.embed_partition(table, rows, partition)?;
            let samples = rows
                .iter()
                .map(|&row_id| Sample {
                    row_id,
                    text: embeddings[&row_id].clone(),
                    signal: table.signals[row_id].clone(),
                    label: labels[row_id],
                })
                .collect();
            Ok(Dataset::new(samples))
        };

        Ok(DatasetSplits {
            train: assemble(Partition::Train)?,
            validation: assemble(Partition::Validation)?,
            test: assemble(Partition::Test)?,
            num_classes,
            class_values: encoder.classes().to_vec(),
            text_dim: self.provider.dim(),
            signal_dim: table.signal_dim(),
            assignment,
        })
    }

    /// One provider call with the partition's distinct rows, keyed by row id.
    fn embed_partition(
        &self,
        table: &RawTable,
        rows: &[usize],
        partition: Partition,
    ) -> Result<HashMap<usize, Vec<f32>>> {
        let unique: Vec<usize> = rows
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }
        let texts: Vec<String> = unique.iter().map(|&id| table.texts[id].clone()).collect();
        let vectors = self.provider.embed(&texts)?;

        let dim = self.provider.dim();
        if vectors.len() != unique.len() || vectors.iter().any(|v| v.len() != dim) {
            return Err(FusionError::data(format!(
                "embedding provider returned a mismatched matrix for the {partition} partition \
                 (expected {} x {dim})",
                unique.len()
            )));
        }
        tracing::debug!("Embedded {} {partition} texts", unique.len());
        Ok(unique.into_iter().zip(vectors).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetKind, Task};
    use crate::embeddings::HashingEmbeddings;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn dataset_config() -> DatasetConfig {
        DatasetConfig {
            label_column: Some("label".into()),
            text_column: "text".into(),
            ..DatasetConfig::preset(DatasetKind::ZuCo, Task::Sentiment)
        }
    }

    /// Provider that records every call and encodes the row id found in the
    /// text (`"row <id>"`) as the first component.
    struct RecordingProvider {
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingProvider {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl EmbeddingProvider for RecordingProvider {
        fn dim(&self) -> usize {
            2
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.lock().unwrap().push(texts.to_vec());
            Ok(texts
                .iter()
                .map(|t| {
                    let id: f32 = t.trim_start_matches("row ").parse().unwrap();
                    vec![id, 1.0]
                })
                .collect())
        }
    }

    struct BrokenProvider;

    impl EmbeddingProvider for BrokenProvider {
        fn dim(&self) -> usize {
            4
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 3]).collect())
        }
    }

    fn imbalanced_table(rows: usize, minority_every: usize) -> RawTable {
        let texts = (0..rows).map(|i| format!("row {i}")).collect();
        let signals = (0..rows).map(|i| vec![i as f32, -(i as f32)]).collect();
        let labels = (0..rows)
            .map(|i| if i % minority_every == 0 { 1.0 } else { 0.0 })
            .collect();
        RawTable::from_columns(texts, signals, labels).unwrap()
    }

    #[test]
    fn test_label_encoder_sorts_distinct_values() {
        let encoder = LabelEncoder::fit(&[3.0, -1.0, 3.0, 0.0]);
        assert_eq!(encoder.classes(), &[-1.0, 0.0, 3.0]);
        assert_eq!(encoder.encode(3.0), Some(2));
        assert_eq!(encoder.encode(-1.0), Some(0));
        assert_eq!(encoder.encode(7.0), None);
    }

    #[test]
    fn test_oversampling_equalizes_class_counts() {
        let labels: Vec<usize> = (0..100).map(|i| usize::from(i % 4 == 0)).collect();
        let split = split_rows(&labels, 2, 0.2, 2);
        let ones = split.train.iter().filter(|&&r| labels[r] == 1).count();
        let zeros = split.train.len() - ones;
        assert_eq!(ones, zeros);
        assert_eq!(zeros, 60);
    }

    #[test]
    fn test_partitions_disjoint_and_exhaustive() {
        let labels: Vec<usize> = (0..103).map(|i| i % 3).collect();
        let split = split_rows(&labels, 3, 0.2, 2);

        let train: BTreeSet<usize> = split.train.iter().copied().collect();
        let val: BTreeSet<usize> = split.validation.iter().copied().collect();
        let test: BTreeSet<usize> = split.test.iter().copied().collect();
        assert!(train.is_disjoint(&val));
        assert!(train.is_disjoint(&test));
        assert!(val.is_disjoint(&test));
        assert_eq!(val.len(), split.validation.len());
        assert_eq!(test.len(), split.test.len());
        assert_eq!(train.len() + val.len() + test.len(), labels.len());
    }

    #[test]
    fn test_holdout_is_stratified_and_even() {
        let labels: Vec<usize> = (0..100).map(|i| usize::from(i >= 50)).collect();
        let split = split_rows(&labels, 2, 0.2, 2);
        assert_eq!(split.validation.len(), 10);
        assert_eq!(split.test.len(), 10);
        let val_ones = split.validation.iter().filter(|&&r| labels[r] == 1).count();
        assert_eq!(val_ones, 5);
    }

    #[test]
    fn test_single_row_class_stays_in_train() {
        let mut labels = vec![0usize; 20];
        labels[7] = 1;
        let split = split_rows(&labels, 2, 0.2, 2);
        assert!(split.train.contains(&7));
        assert!(!split.validation.contains(&7));
        assert!(!split.test.contains(&7));
    }

    #[test]
    fn test_split_is_deterministic() {
        let labels: Vec<usize> = (0..40).map(|i| i % 2).collect();
        assert_eq!(split_rows(&labels, 2, 0.2, 9), split_rows(&labels, 2, 0.2, 9));
    }

    #[test]
    fn test_one_provider_call_per_partition() {
        let table = imbalanced_table(60, 3);
        let provider = RecordingProvider::new();
        let config = dataset_config();
        let splits = DatasetBuilder::new(&config, &provider, 2)
            .build_from_table(&table)
            .unwrap();

        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let sizes: Vec<usize> = calls.iter().map(Vec::len).collect();
        assert_eq!(sizes[0], splits.train.unique_row_ids().len());
        assert_eq!(sizes[1], splits.validation.len());
        assert_eq!(sizes[2], splits.test.len());

        let train_texts: BTreeSet<&String> = calls[0].iter().collect();
        assert_eq!(train_texts.len(), calls[0].len(), "no duplicate texts per call");
        assert!(calls[1].iter().all(|t| !train_texts.contains(t)));
    }

    #[test]
    fn test_samples_joined_by_row_id() {
        let table = imbalanced_table(60, 3);
        let provider = RecordingProvider::new();
        let config = dataset_config();
        let splits = DatasetBuilder::new(&config, &provider, 2)
            .build_from_table(&table)
            .unwrap();

        for dataset in [&splits.train, &splits.validation, &splits.test] {
            for sample in dataset.samples() {
                assert_eq!(sample.text[0], sample.row_id as f32);
                assert_eq!(sample.signal[0], sample.row_id as f32);
                assert_eq!(sample.label, usize::from(sample.row_id % 3 == 0));
            }
        }
        assert_eq!(splits.num_classes, 2);
        assert_eq!(splits.class_values, vec![0.0, 1.0]);
        assert_eq!(splits.signal_dim, 2);
        assert_eq!(splits.text_dim, 2);
    }

    #[test]
    fn test_mismatched_provider_matrix() {
        let table = imbalanced_table(20, 2);
        let config = dataset_config();
        let err = DatasetBuilder::new(&config, &BrokenProvider, 2)
            .build_from_table(&table)
            .unwrap_err();
        assert!(matches!(err, FusionError::Data(_)));
    }

    #[test]
    fn test_single_class_table_rejected() {
        let table = RawTable::from_columns(
            vec!["a".into(), "b".into()],
            vec![vec![0.0], vec![1.0]],
            vec![1.0, 1.0],
        )
        .unwrap();
        let config = dataset_config();
        let provider = HashingEmbeddings::new(4);
        let err = DatasetBuilder::new(&config, &provider, 2)
            .build_from_table(&table)
            .unwrap_err();
        assert!(matches!(err, FusionError::Data(_)));
    }

    #[test]
    fn test_csv_signal_columns_inferred() {
        let csv = ",text,label,f1,f2\n0,hello there,1,0.5,0.25\n1,bye,0,1.5,2\n";
        let table = RawTable::from_reader(csv.as_bytes(), &dataset_config()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.signal_columns(), &["f1".to_string(), "f2".to_string()]);
        assert_eq!(table.signals[1], vec![1.5, 2.0]);
    }

    #[test]
    fn test_csv_explicit_signal_columns() {
        let csv = "text,label,f1,f2\nx,1,0.5,0.25\n";
        let config = DatasetConfig {
            signal_columns: Some(vec!["f2".into()]),
            ..dataset_config()
        };
        let table = RawTable::from_reader(csv.as_bytes(), &config).unwrap();
        assert_eq!(table.signal_dim(), 1);

        let config = DatasetConfig {
            signal_columns: Some(vec!["f9".into()]),
            ..dataset_config()
        };
        let err = RawTable::from_reader(csv.as_bytes(), &config).unwrap_err();
        assert!(matches!(err, FusionError::Config(_)));
    }

    #[test]
    fn test_csv_missing_label_column() {
        let csv = "text,sentiment,f1\nx,1,0.5\n";
        let err = RawTable::from_reader(csv.as_bytes(), &dataset_config()).unwrap_err();
        assert!(matches!(err, FusionError::Config(_)));
        assert!(err.to_string().contains("label"));
    }

    #[test]
    fn test_csv_non_numeric_signal() {
        let csv = "text,label,f1\nx,1,abc\n";
        let err = RawTable::from_reader(csv.as_bytes(), &dataset_config()).unwrap_err();
        assert!(matches!(err, FusionError::Data(_)));
    }

    #[test]
    fn test_csv_ragged_row() {
        let csv = "text,label,f1,f2\nx,1,0.5,0.1\ny,0,0.5\n";
        let err = RawTable::from_reader(csv.as_bytes(), &dataset_config()).unwrap_err();
        assert!(matches!(err, FusionError::Data(_)));
    }

    #[test]
    fn test_csv_empty_table() {
        let csv = "text,label,f1\n";
        let err = RawTable::from_reader(csv.as_bytes(), &dataset_config()).unwrap_err();
        assert!(matches!(err, FusionError::Data(_)));
    }

    #[test]
    fn test_export_splits() {
        let labels: Vec<usize> = (0..30).map(|i| i % 2).collect();
        let split = split_rows(&labels, 2, 0.2, 2);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("splits.csv");
        split.export_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("row_id,partition"));
        assert_eq!(lines.count(), 30);
    }
}
