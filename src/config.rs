//! Configuration parsing and validation.
//!
//! A run is fully described by one immutable [`ExperimentConfig`] that is
//! loaded from YAML, optionally patched by CLI flags through
//! [`RunSelection`], validated once, and then passed by reference into every
//! component constructor.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};

/// Main configuration for one training/evaluation run.
///
/// # Example
///
/// ```rust
/// use fusion_affect_rs::ExperimentConfig;
///
/// # fn main() -> fusion_affect_rs::Result<()> {
/// let config = ExperimentConfig::from_preset("zuco-sa")?;
/// config.validate()?;
/// assert_eq!(config.run_tag()?, "transformer_text/sentence");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Model kind, modality and architecture.
    pub model: ModelConfig,

    /// Input table selection and split parameters.
    pub dataset: DatasetConfig,

    /// Text embedding provider.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Optimization and loop parameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Fusion/alignment objective parameters.
    #[serde(default)]
    pub objectives: ObjectiveConfig,

    /// Root directory for checkpoints, histories and dumps.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed for sampling, shuffling and initialization order.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./baselines".into()
}

fn default_seed() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

/// Model variant requested on the command line.
///
/// The serialized names match the experiment scripts this crate replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    /// Transformer encoder over one modality.
    #[serde(rename = "transformer")]
    Transformer,
    /// Bidirectional LSTM over one modality.
    #[serde(rename = "biLSTM")]
    BiLstm,
    /// Feed-forward network over one modality.
    #[serde(rename = "MLP")]
    Mlp,
    /// 1-D convolutional residual network over one modality.
    #[serde(rename = "resnet")]
    ResNet,
    /// Concatenation fusion of both modalities.
    #[serde(rename = "fusion")]
    Fusion,
    /// Fusion regularized by canonical correlation.
    #[serde(rename = "CCA_fusion")]
    CcaFusion,
    /// Fusion regularized by Wasserstein distance.
    #[serde(rename = "WD_fusion")]
    WdFusion,
    /// Two classifiers aligned by canonical correlation.
    #[serde(rename = "CCA_ds")]
    CcaAlignment,
    /// Two classifiers aligned by Wasserstein distance.
    #[serde(rename = "WD_ds")]
    WdAlignment,
}

impl ModelKind {
    /// Every supported kind, in CLI order.
    pub const ALL: [ModelKind; 9] = [
        ModelKind::Transformer,
        ModelKind::BiLstm,
        ModelKind::Mlp,
        ModelKind::ResNet,
        ModelKind::Fusion,
        ModelKind::CcaFusion,
        ModelKind::WdFusion,
        ModelKind::CcaAlignment,
        ModelKind::WdAlignment,
    ];

    /// Name used on the command line and in output paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ModelKind::Transformer => "transformer",
            ModelKind::BiLstm => "biLSTM",
            ModelKind::Mlp => "MLP",
            ModelKind::ResNet => "resnet",
            ModelKind::Fusion => "fusion",
            ModelKind::CcaFusion => "CCA_fusion",
            ModelKind::WdFusion => "WD_fusion",
            ModelKind::CcaAlignment => "CCA_ds",
            ModelKind::WdAlignment => "WD_ds",
        }
    }

    /// Training family this kind belongs to.
    #[must_use]
    pub const fn family(self) -> ModelFamily {
        match self {
            ModelKind::Transformer | ModelKind::BiLstm | ModelKind::Mlp | ModelKind::ResNet => {
                ModelFamily::Single
            }
            ModelKind::Fusion => ModelFamily::Fusion(None),
            ModelKind::CcaFusion => ModelFamily::Fusion(Some(ObjectiveKind::Cca)),
            ModelKind::WdFusion => ModelFamily::Fusion(Some(ObjectiveKind::Wasserstein)),
            ModelKind::CcaAlignment => ModelFamily::Alignment(ObjectiveKind::Cca),
            ModelKind::WdAlignment => ModelFamily::Alignment(ObjectiveKind::Wasserstein),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                FusionError::config(format!(
                    "unknown model '{s}'; expected one of {}",
                    ModelKind::ALL.map(ModelKind::as_str).join(", ")
                ))
            })
    }
}

/// Coupling objective between two latent batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectiveKind {
    /// Canonical correlation analysis.
    Cca,
    /// Wasserstein (earth mover's) distance.
    Wasserstein,
}

/// Training family, resolved once from a [`ModelKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// One encoder on one modality.
    Single,
    /// Two encoders plus a joint head, with an optional consistency objective.
    Fusion(Option<ObjectiveKind>),
    /// Two independent classifiers coupled by an alignment penalty.
    Alignment(ObjectiveKind),
}

impl ModelFamily {
    /// Whether the family needs both modalities.
    #[must_use]
    pub const fn is_dual(self) -> bool {
        !matches!(self, ModelFamily::Single)
    }
}

/// Input modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Sentence embeddings.
    Text,
    /// EEG/physiological signal vectors.
    Eeg,
    /// Both modalities.
    Fusion,
}

impl Modality {
    /// Name used on the command line and in output paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Eeg => "eeg",
            Modality::Fusion => "fusion",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(Modality::Text),
            "eeg" => Ok(Modality::Eeg),
            "fusion" => Ok(Modality::Fusion),
            _ => Err(FusionError::config(format!(
                "unknown modality '{s}'; expected one of text, eeg, fusion"
            ))),
        }
    }
}

/// Model selection and architecture hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model variant.
    pub kind: ModelKind,

    /// Input modality; dual-branch kinds default to `fusion`.
    #[serde(default)]
    pub modality: Option<Modality>,

    /// Encoder and head sizes.
    #[serde(default)]
    pub architecture: ArchitectureConfig,
}

/// Encoder and head hyperparameters shared by every model kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Transformer model width; also scales the learning-rate schedule.
    #[serde(default = "default_d_model")]
    pub d_model: usize,

    /// Feed-forward inner width.
    #[serde(default = "default_d_inner")]
    pub d_inner: usize,

    /// Latent width every encoder produces.
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    /// Number of encoder layers (attention layers or residual blocks).
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Number of attention heads.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// Dropout probability applied during training passes.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Number of input features grouped into one sequence position.
    #[serde(default = "default_patch_width")]
    pub patch_width: usize,

    /// Output class count; inferred from the training labels when absent,
    /// a run fails when it disagrees with them.
    #[serde(default)]
    pub num_classes: Option<usize>,
}

fn default_d_model() -> usize {
    64
}
fn default_d_inner() -> usize {
    128
}
fn default_hidden_dim() -> usize {
    32
}
fn default_num_layers() -> usize {
    2
}
fn default_num_heads() -> usize {
    4
}
fn default_dropout() -> f32 {
    0.1
}
fn default_patch_width() -> usize {
    16
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            d_model: default_d_model(),
            d_inner: default_d_inner(),
            hidden_dim: default_hidden_dim(),
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            dropout: default_dropout(),
            patch_width: default_patch_width(),
            num_classes: None,
        }
    }
}

/// Source dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetKind {
    /// K-EmoCon conversational affect dataset.
    #[serde(rename = "KEmoCon")]
    KEmoCon,
    /// ZuCo reading corpus.
    #[serde(rename = "ZuCo")]
    ZuCo,
}

impl DatasetKind {
    /// Name used on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DatasetKind::KEmoCon => "KEmoCon",
            DatasetKind::ZuCo => "ZuCo",
        }
    }
}

impl FromStr for DatasetKind {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "KEmoCon" => Ok(DatasetKind::KEmoCon),
            "ZuCo" => Ok(DatasetKind::ZuCo),
            _ => Err(FusionError::config(format!(
                "unknown dataset '{s}'; expected one of KEmoCon, ZuCo"
            ))),
        }
    }
}

/// ZuCo labeling task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Sentiment analysis.
    #[default]
    #[serde(rename = "SA")]
    Sentiment,
    /// Relation detection (reading comprehension).
    #[serde(rename = "RD")]
    RelationDetection,
}

impl Task {
    /// Name used on the command line and in data paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Task::Sentiment => "SA",
            Task::RelationDetection => "RD",
        }
    }
}

impl FromStr for Task {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SA" => Ok(Task::Sentiment),
            "RD" => Ok(Task::RelationDetection),
            _ => Err(FusionError::config(format!(
                "unknown task '{s}'; expected one of SA, RD"
            ))),
        }
    }
}

/// EEG feature granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Word-level features.
    Word,
    /// Concatenated word-level features.
    #[serde(rename = "concatword")]
    ConcatWord,
    /// Sentence-level features.
    #[default]
    Sentence,
}

impl Level {
    /// Name used on the command line and in output paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Word => "word",
            Level::ConcatWord => "concatword",
            Level::Sentence => "sentence",
        }
    }
}

impl FromStr for Level {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "word" => Ok(Level::Word),
            "concatword" => Ok(Level::ConcatWord),
            "sentence" => Ok(Level::Sentence),
            _ => Err(FusionError::config(format!(
                "unknown level '{s}'; expected one of word, concatword, sentence"
            ))),
        }
    }
}

/// Dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Source dataset.
    pub name: DatasetKind,

    /// Labeling task (ZuCo only).
    #[serde(default)]
    pub task: Task,

    /// EEG granularity level (ZuCo only; still used to key outputs).
    #[serde(default)]
    pub level: Level,

    /// Explicit table path, overriding the preset location.
    #[serde(default)]
    pub path: Option<String>,

    /// Root under which preset table locations are resolved.
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// ZuCo subject identifier used in preset file names.
    #[serde(default = "default_subject")]
    pub subject: String,

    /// Label column; defaults depend on dataset and task.
    #[serde(default)]
    pub label_column: Option<String>,

    /// Free-text column.
    #[serde(default = "default_text_column")]
    pub text_column: String,

    /// Signal columns; all remaining numeric columns when absent.
    #[serde(default)]
    pub signal_columns: Option<Vec<String>>,

    /// Fraction of rows held out for validation + test.
    #[serde(default = "default_holdout_ratio")]
    pub holdout_ratio: f32,

    /// Write the `row_id,partition` assignment next to the outputs.
    #[serde(default)]
    pub export_splits: bool,
}

fn default_data_root() -> String {
    ".".into()
}
fn default_subject() -> String {
    "ZAB".into()
}
fn default_text_column() -> String {
    "new_words".into()
}
fn default_holdout_ratio() -> f32 {
    0.2
}

impl DatasetConfig {
    /// Preset for a dataset/task pair.
    #[must_use]
    pub fn preset(name: DatasetKind, task: Task) -> Self {
        Self {
            name,
            task,
            level: Level::Sentence,
            path: None,
            data_root: default_data_root(),
            subject: default_subject(),
            label_column: None,
            text_column: default_text_column(),
            signal_columns: None,
            holdout_ratio: default_holdout_ratio(),
            export_splits: false,
        }
    }

    /// Table location: the explicit path, or the preset layout under `data_root`.
    #[must_use]
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return PathBuf::from(path);
        }
        let root = Path::new(&self.data_root);
        match self.name {
            DatasetKind::KEmoCon => root.join("preprocessed_kemo/KEmoCon/df.csv"),
            DatasetKind::ZuCo => root.join(format!(
                "preprocessed_eeg/ZuCo/{}/{}_{}.csv",
                self.task.as_str(),
                self.subject,
                self.level.as_str()
            )),
        }
    }

    /// Label column: the explicit one, or the dataset/task default.
    #[must_use]
    pub fn resolved_label_column(&self) -> String {
        if let Some(column) = &self.label_column {
            return column.clone();
        }
        match (self.name, self.task) {
            (DatasetKind::KEmoCon, _) => "arousal".into(),
            (DatasetKind::ZuCo, Task::Sentiment) => "sentiment".into(),
            (DatasetKind::ZuCo, Task::RelationDetection) => "label".into(),
        }
    }
}

/// Text embedding provider selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Deterministic feature hashing, no external service.
    #[default]
    Hashing,
    /// Precomputed embeddings from an external encoder, one JSON object per line.
    Jsonl,
}

/// Embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider.
    #[serde(default)]
    pub provider: EmbeddingProviderKind,

    /// Embedding width (hashing provider; checked against JSONL vectors).
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,

    /// JSONL file for the `jsonl` provider.
    #[serde(default)]
    pub path: Option<String>,
}

fn default_embedding_dim() -> usize {
    128
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Hashing,
            dim: default_embedding_dim(),
            path: None,
        }
    }
}

/// Learning-rate schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// Linear warmup then inverse square-root decay, scaled by `d_model^-0.5`.
    #[default]
    WarmupInverseSqrt,
    /// Constant `learning_rate`.
    Constant,
}

/// Validation metric used to rank epochs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalIndicatorKind {
    /// Unweighted mean of per-class F1.
    #[default]
    MacroF1,
    /// Unweighted mean of per-class recall.
    BalancedAccuracy,
    /// Plain accuracy.
    Accuracy,
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Batch size for every pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Warmup steps of the learning-rate schedule.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,

    /// Learning-rate schedule.
    #[serde(default)]
    pub lr_schedule: LrSchedule,

    /// Base learning rate for the constant schedule.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Adam beta1.
    #[serde(default = "default_beta1")]
    pub beta1: f64,

    /// Adam beta2.
    #[serde(default = "default_beta2")]
    pub beta2: f64,

    /// Adam epsilon.
    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Decoupled weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Validation metric for checkpoint selection.
    #[serde(default)]
    pub eval_indicator: EvalIndicatorKind,

    /// Background collation threads; 0 collates on the training thread.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Batches buffered ahead of the training thread.
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,

    /// Draw progress bars.
    #[serde(default = "default_true")]
    pub progress: bool,
}

fn default_epochs() -> usize {
    30
}
fn default_batch_size() -> usize {
    32
}
fn default_warmup_steps() -> usize {
    400
}
fn default_lr() -> f64 {
    1e-4
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.98
}
fn default_eps() -> f64 {
    1e-4
}
fn default_weight_decay() -> f64 {
    1e-2
}
fn default_num_workers() -> usize {
    2
}
fn default_prefetch_factor() -> usize {
    2
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            warmup_steps: default_warmup_steps(),
            lr_schedule: LrSchedule::WarmupInverseSqrt,
            learning_rate: default_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: default_weight_decay(),
            eval_indicator: EvalIndicatorKind::MacroF1,
            num_workers: default_num_workers(),
            prefetch_factor: default_prefetch_factor(),
            progress: true,
        }
    }
}

/// Canonical-correlation objective settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcaConfig {
    /// Number of canonical components, and the fusion projection width.
    #[serde(default = "default_outdim_size")]
    pub outdim_size: usize,

    /// Use every canonical component instead of the top `outdim_size`.
    #[serde(default)]
    pub use_all_singular_values: bool,

    /// Diagonal regularization of the first view's covariance.
    #[serde(default = "default_cca_reg")]
    pub r1: f64,

    /// Diagonal regularization of the second view's covariance.
    #[serde(default = "default_cca_reg")]
    pub r2: f64,

    /// Floor applied to eigenvalues before the square root.
    #[serde(default = "default_cca_eps")]
    pub eps: f64,

    /// Newton–Schulz iterations for the inverse square roots.
    #[serde(default = "default_ns_iters")]
    pub newton_schulz_iters: usize,
}

fn default_outdim_size() -> usize {
    8
}
fn default_cca_reg() -> f64 {
    1e-3
}
fn default_cca_eps() -> f64 {
    1e-9
}
fn default_ns_iters() -> usize {
    30
}

impl Default for CcaConfig {
    fn default() -> Self {
        Self {
            outdim_size: default_outdim_size(),
            use_all_singular_values: false,
            r1: default_cca_reg(),
            r2: default_cca_reg(),
            eps: default_cca_eps(),
            newton_schulz_iters: default_ns_iters(),
        }
    }
}

/// How the Wasserstein distance reduces two latent batches to 1-D samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WassersteinMode {
    /// One distribution over every latent value.
    Flattened,
    /// Average over random unit projections of the latent rows.
    #[default]
    Sliced,
}

/// Wasserstein objective settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WassersteinConfig {
    /// Reduction mode.
    #[serde(default)]
    pub mode: WassersteinMode,

    /// Number of projections in sliced mode.
    #[serde(default = "default_projections")]
    pub projections: usize,

    /// Seed of the projection directions.
    #[serde(default = "default_projection_seed")]
    pub seed: u64,
}

fn default_projections() -> usize {
    32
}
fn default_projection_seed() -> u64 {
    7
}

impl Default for WassersteinConfig {
    fn default() -> Self {
        Self {
            mode: WassersteinMode::Sliced,
            projections: default_projections(),
            seed: default_projection_seed(),
        }
    }
}

/// Fusion and alignment objective configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveConfig {
    /// CCA settings.
    #[serde(default)]
    pub cca: CcaConfig,

    /// Wasserstein settings.
    #[serde(default)]
    pub wasserstein: WassersteinConfig,

    /// Weight of the fusion consistency loss.
    #[serde(default = "default_loss_weight")]
    pub fusion_weight: f64,

    /// Weight of the alignment penalty.
    #[serde(default = "default_loss_weight")]
    pub alignment_weight: f64,

    /// Detach the text latent in the alignment penalty (asymmetric alignment).
    #[serde(default = "default_true")]
    pub detach_text_latent: bool,
}

fn default_loss_weight() -> f64 {
    1.0
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self {
            cca: CcaConfig::default(),
            wasserstein: WassersteinConfig::default(),
            fusion_weight: default_loss_weight(),
            alignment_weight: default_loss_weight(),
            detach_text_latent: true,
        }
    }
}

/// Command-line selection applied on top of a loaded configuration.
///
/// Every field is optional; present fields replace the configured value.
#[derive(Debug, Clone, Default)]
pub struct RunSelection {
    /// `--model`
    pub model: Option<String>,
    /// `--modality`
    pub modality: Option<String>,
    /// `--dataset`
    pub dataset: Option<String>,
    /// `--task`
    pub task: Option<String>,
    /// `--level`
    pub level: Option<String>,
    /// `--epochs`
    pub epochs: Option<usize>,
    /// `--output-dir`
    pub output_dir: Option<String>,
}

impl RunSelection {
    /// Build a configuration from the selection alone, starting from the
    /// preset of the selected dataset.
    ///
    /// # Errors
    ///
    /// Fails when no model or dataset is selected or a name is unknown.
    pub fn into_config(self) -> Result<ExperimentConfig> {
        let dataset: DatasetKind = self
            .dataset
            .as_deref()
            .ok_or_else(|| FusionError::config("--dataset is required without --config"))?
            .parse()?;
        let task = self.task.as_deref().map(Task::from_str).transpose()?.unwrap_or_default();
        let kind: ModelKind = self
            .model
            .as_deref()
            .ok_or_else(|| FusionError::config("--model is required without --config"))?
            .parse()?;

        let mut config = ExperimentConfig::for_dataset(dataset, task);
        config.model.kind = kind;
        config.model.modality = None;
        self.apply(config)
    }

    /// Apply the selection to `config`.
    ///
    /// # Errors
    ///
    /// Fails when a selected name is unknown.
    pub fn apply(self, mut config: ExperimentConfig) -> Result<ExperimentConfig> {
        if let Some(model) = self.model.as_deref() {
            let kind: ModelKind = model.parse()?;
            config.model.kind = kind;
            // A dual-branch model picked on the command line defaults to `fusion`.
            if self.modality.is_none() && kind.family().is_dual() {
                config.model.modality = None;
            }
        }
        if let Some(modality) = self.modality.as_deref() {
            config.model.modality = Some(modality.parse()?);
        }
        if let Some(dataset) = self.dataset.as_deref() {
            config.dataset.name = dataset.parse()?;
        }
        if let Some(task) = self.task.as_deref() {
            config.dataset.task = task.parse()?;
        }
        if let Some(level) = self.level.as_deref() {
            config.dataset.level = level.parse()?;
        }
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        Ok(config)
    }
}

impl ExperimentConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a valid configuration.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"kemocon"` - K-EmoCon arousal, text transformer
    /// - `"zuco-sa"` - ZuCo sentiment analysis, text transformer
    /// - `"zuco-rd"` - ZuCo relation detection, text transformer
    ///
    /// # Errors
    ///
    /// Fails for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "kemocon" => Ok(Self::for_dataset(DatasetKind::KEmoCon, Task::Sentiment)),
            "zuco-sa" => Ok(Self::for_dataset(DatasetKind::ZuCo, Task::Sentiment)),
            "zuco-rd" => Ok(Self::for_dataset(DatasetKind::ZuCo, Task::RelationDetection)),
            _ => Err(FusionError::config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Default configuration for a dataset/task pair with a text transformer.
    #[must_use]
    pub fn for_dataset(name: DatasetKind, task: Task) -> Self {
        Self {
            model: ModelConfig {
                kind: ModelKind::Transformer,
                modality: Some(Modality::Text),
                architecture: ArchitectureConfig::default(),
            },
            dataset: DatasetConfig::preset(name, task),
            embedding: EmbeddingConfig::default(),
            training: TrainingConfig::default(),
            objectives: ObjectiveConfig::default(),
            output_dir: default_output_dir(),
            seed: default_seed(),
        }
    }

    /// Resolved training family.
    #[must_use]
    pub fn family(&self) -> ModelFamily {
        self.model.kind.family()
    }

    /// Resolve the modality for the configured model kind.
    ///
    /// Single-modality kinds need `text` or `eeg`; dual-branch kinds need
    /// `fusion`, which is also their default.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error naming the requested combination.
    pub fn resolved_modality(&self) -> Result<Modality> {
        let kind = self.model.kind;
        match (kind.family(), self.model.modality) {
            (ModelFamily::Single, Some(m @ (Modality::Text | Modality::Eeg))) => Ok(m),
            (ModelFamily::Single, None) => Err(FusionError::config(format!(
                "model '{kind}' needs --modality text or eeg"
            ))),
            (
                ModelFamily::Fusion(_) | ModelFamily::Alignment(_),
                Some(Modality::Fusion) | None,
            ) => Ok(Modality::Fusion),
            (_, Some(modality)) => Err(FusionError::config(format!(
                "unsupported combination: model '{kind}' with modality '{modality}'"
            ))),
        }
    }

    /// Tag identifying the run's outputs: `{kind}_{modality}/{level}`.
    ///
    /// # Errors
    ///
    /// Fails when the modality cannot be resolved.
    pub fn run_tag(&self) -> Result<String> {
        Ok(format!(
            "{}_{}/{}",
            self.model.kind,
            self.resolved_modality()?,
            self.dataset.level.as_str()
        ))
    }

    /// Human readable description of the requested combination.
    #[must_use]
    pub fn describe(&self) -> String {
        let modality = self
            .model
            .modality
            .map_or_else(|| "<default>".to_string(), |m| m.to_string());
        format!(
            "model={} modality={} dataset={} task={} level={}",
            self.model.kind,
            modality,
            self.dataset.name.as_str(),
            self.dataset.task.as_str(),
            self.dataset.level.as_str()
        )
    }

    /// Validate the configuration.
    ///
    /// Runs before any data is loaded so that invalid combinations are
    /// rejected up front.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint as a configuration error.
    pub fn validate(&self) -> Result<()> {
        self.resolved_modality()
            .map_err(|e| FusionError::config(format!("{} ({})", strip(&e), self.describe())))?;

        let arch = &self.model.architecture;
        if arch.d_model == 0 || arch.hidden_dim == 0 || arch.d_inner == 0 {
            return Err(FusionError::config("architecture widths must be > 0"));
        }
        if arch.num_heads == 0 || arch.d_model % arch.num_heads != 0 {
            return Err(FusionError::config(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                arch.d_model, arch.num_heads
            )));
        }
        if arch.num_layers == 0 {
            return Err(FusionError::config("num_layers must be > 0"));
        }
        if arch.patch_width == 0 {
            return Err(FusionError::config("patch_width must be > 0"));
        }
        if !(0.0..1.0).contains(&arch.dropout) {
            return Err(FusionError::config("dropout must be in [0, 1)"));
        }
        if let Some(classes) = arch.num_classes {
            if classes < 2 {
                return Err(FusionError::config("num_classes must be >= 2"));
            }
        }

        if !(self.dataset.holdout_ratio > 0.0 && self.dataset.holdout_ratio < 1.0) {
            return Err(FusionError::config("dataset.holdout_ratio must be in (0, 1)"));
        }
        if self.dataset.text_column.is_empty() {
            return Err(FusionError::config("dataset.text_column is required"));
        }
        if self.dataset.name == DatasetKind::ZuCo && self.dataset.subject.is_empty() {
            return Err(FusionError::config("dataset.subject is required for ZuCo"));
        }

        if self.embedding.dim == 0 {
            return Err(FusionError::config("embedding.dim must be > 0"));
        }
        if self.embedding.provider == EmbeddingProviderKind::Jsonl && self.embedding.path.is_none()
        {
            return Err(FusionError::config("embedding.path is required for the jsonl provider"));
        }

        let training = &self.training;
        if training.epochs == 0 {
            return Err(FusionError::config("training.epochs must be > 0"));
        }
        if training.batch_size == 0 {
            return Err(FusionError::config("training.batch_size must be > 0"));
        }
        if training.warmup_steps == 0 {
            return Err(FusionError::config("training.warmup_steps must be > 0"));
        }

        let objectives = &self.objectives;
        if objectives.cca.outdim_size == 0 {
            return Err(FusionError::config("objectives.cca.outdim_size must be > 0"));
        }
        if objectives.cca.r1 < 0.0 || objectives.cca.r2 < 0.0 {
            return Err(FusionError::config("CCA regularization must be >= 0"));
        }
        if objectives.wasserstein.mode == WassersteinMode::Sliced
            && objectives.wasserstein.projections == 0
        {
            return Err(FusionError::config("objectives.wasserstein.projections must be > 0"));
        }

        Ok(())
    }
}

fn strip(error: &FusionError) -> String {
    match error {
        FusionError::Config(msg) => msg.clone(),
        other => other.to_string(),
    }
}
