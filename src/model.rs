//! Model selection: `(kind, modality, hyperparameters, widths)` to a model.

use candle_core::{Module, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use crate::config::{ExperimentConfig, ModelFamily, ModelKind, Modality};
use crate::encoders::{Encoder, EncoderKind};
use crate::error::{FusionError, Result};
use crate::loader::Batch;
use crate::objectives::PairObjective;

/// Encoder plus linear classifier head.
pub struct Branch {
    encoder: Encoder,
    head: Linear,
}

/// Latent and logits of one branch.
#[derive(Debug, Clone)]
pub struct BranchOutput {
    /// `[batch, hidden]`
    pub latent: Tensor,
    /// `[batch, classes]`
    pub logits: Tensor,
}

impl Branch {
    /// Build a branch for inputs of `input_dim` features.
    ///
    /// # Errors
    ///
    /// Propagates candle errors while creating parameters.
    pub fn new(
        kind: EncoderKind,
        input_dim: usize,
        config: &ExperimentConfig,
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let arch = &config.model.architecture;
        Ok(Self {
            encoder: Encoder::new(kind, input_dim, arch, vb.pp("encoder"))?,
            head: linear(arch.hidden_dim, num_classes, vb.pp("head"))?,
        })
    }

    /// Forward pass.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<BranchOutput> {
        let latent = self.encoder.forward(x, train)?;
        let logits = self.head.forward(&latent)?;
        Ok(BranchOutput { latent, logits })
    }
}

/// Projects both latents, concatenates them and classifies.
pub struct FusionHead {
    text_proj: Linear,
    signal_proj: Linear,
    classifier: Linear,
}

/// Outputs of the fusion head.
#[derive(Debug, Clone)]
pub struct FusionHeadOutput {
    /// Projected text latent `[batch, outdim]`.
    pub text: Tensor,
    /// Projected signal latent `[batch, outdim]`.
    pub signal: Tensor,
    /// Joint logits `[batch, classes]`.
    pub logits: Tensor,
}

impl FusionHead {
    /// Head projecting `hidden`-wide latents to `outdim`.
    ///
    /// # Errors
    ///
    /// Propagates candle errors while creating parameters.
    pub fn new(hidden: usize, outdim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            text_proj: linear(hidden, outdim, vb.pp("text_proj"))?,
            signal_proj: linear(hidden, outdim, vb.pp("signal_proj"))?,
            classifier: linear(2 * outdim, num_classes, vb.pp("classifier"))?,
        })
    }

    /// Forward pass.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn forward(
        &self,
        text_latent: &Tensor,
        signal_latent: &Tensor,
    ) -> Result<FusionHeadOutput> {
        let text = self.text_proj.forward(text_latent)?;
        let signal = self.signal_proj.forward(signal_latent)?;
        let joint = Tensor::cat(&[&text, &signal], D::Minus1)?;
        let logits = self.classifier.forward(&joint.relu()?)?;
        Ok(FusionHeadOutput {
            text,
            signal,
            logits,
        })
    }
}

/// One branch on one modality.
pub struct SingleModel {
    branch: Branch,
    modality: Modality,
}

impl SingleModel {
    /// Input modality.
    #[must_use]
    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Logits for the batch's selected modality.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let input = match self.modality {
            Modality::Eeg => &batch.signal,
            _ => &batch.text,
        };
        Ok(self.branch.forward(input, train)?.logits)
    }
}

/// Text and signal branches joined by a [`FusionHead`].
pub struct FusionModel {
    text: Branch,
    signal: Branch,
    head: FusionHead,
    objective: Option<PairObjective>,
}

/// Outputs of a fusion forward pass.
#[derive(Debug, Clone)]
pub struct FusionOutput {
    /// Text branch.
    pub text: BranchOutput,
    /// Signal branch.
    pub signal: BranchOutput,
    /// Fusion head.
    pub head: FusionHeadOutput,
}

impl FusionModel {
    /// Consistency objective on the projected latents, if any.
    #[must_use]
    pub fn objective(&self) -> Option<&PairObjective> {
        self.objective.as_ref()
    }

    /// Forward both branches and the head.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<FusionOutput> {
        let text = self.text.forward(&batch.text, train)?;
        let signal = self.signal.forward(&batch.signal, train)?;
        let head = self.head.forward(&text.latent, &signal.latent)?;
        Ok(FusionOutput { text, signal, head })
    }
}

/// Two classifiers coupled by an alignment penalty.
pub struct AlignmentModel {
    text: Branch,
    signal: Branch,
    objective: PairObjective,
}

/// Outputs of an alignment forward pass.
#[derive(Debug, Clone)]
pub struct AlignmentOutput {
    /// Text branch.
    pub text: BranchOutput,
    /// Signal branch.
    pub signal: BranchOutput,
}

impl AlignmentOutput {
    /// Prediction distribution: mean of the two branch softmaxes.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn probabilities(&self) -> Result<Tensor> {
        let p_text = candle_nn::ops::softmax_last_dim(&self.text.logits)?;
        let p_signal = candle_nn::ops::softmax_last_dim(&self.signal.logits)?;
        Ok(p_text.add(&p_signal)?.affine(0.5, 0.0)?)
    }
}

impl AlignmentModel {
    /// Alignment penalty.
    #[must_use]
    pub fn objective(&self) -> &PairObjective {
        &self.objective
    }

    /// Forward both branches.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<AlignmentOutput> {
        Ok(AlignmentOutput {
            text: self.text.forward(&batch.text, train)?,
            signal: self.signal.forward(&batch.signal, train)?,
        })
    }
}

/// Model resolved for a run.
pub enum SelectedModel {
    /// Single-modality classifier.
    Single(SingleModel),
    /// Fusion of both modalities.
    Fusion(FusionModel),
    /// Aligned pair of classifiers.
    Alignment(AlignmentModel),
}

impl SelectedModel {
    /// Family of the model.
    #[must_use]
    pub fn family_name(&self) -> &'static str {
        match self {
            SelectedModel::Single(_) => "single",
            SelectedModel::Fusion(_) => "fusion",
            SelectedModel::Alignment(_) => "alignment",
        }
    }
}

fn encoder_kind(kind: ModelKind) -> EncoderKind {
    match kind {
        ModelKind::BiLstm => EncoderKind::BiLstm,
        ModelKind::Mlp => EncoderKind::Mlp,
        ModelKind::ResNet => EncoderKind::ResNet,
        _ => EncoderKind::Transformer,
    }
}

/// Build the model for `config` over inputs of the given widths.
///
/// Parameters are created under `vb`, so they live in the caller's `VarMap`.
///
/// # Errors
///
/// `Config` for invalid kind/modality pairs or fewer than two classes.
pub fn select_model(
    config: &ExperimentConfig,
    text_dim: usize,
    signal_dim: usize,
    num_classes: usize,
    vb: VarBuilder,
) -> Result<SelectedModel> {
    let modality = config.resolved_modality()?;
    if num_classes < 2 {
        return Err(FusionError::config(format!(
            "need at least 2 classes, got {num_classes}"
        )));
    }
    if let Some(declared) = config.model.architecture.num_classes {
        if declared != num_classes {
            return Err(FusionError::config(format!(
                "architecture.num_classes is {declared} but the labels encode {num_classes} classes"
            )));
        }
    }
    let kind = config.model.kind;
    let hidden = config.model.architecture.hidden_dim;
    tracing::info!(
        "Building {kind} model: modality={modality}, classes={num_classes}, \
         text_dim={text_dim}, signal_dim={signal_dim}"
    );

    let transformer_branch = |input_dim: usize, prefix: &str| {
        Branch::new(
            EncoderKind::Transformer,
            input_dim,
            config,
            num_classes,
            vb.pp(prefix),
        )
    };

    let model = match kind.family() {
        ModelFamily::Single => {
            let input_dim = if modality == Modality::Eeg {
                signal_dim
            } else {
                text_dim
            };
            SelectedModel::Single(SingleModel {
                branch: Branch::new(
                    encoder_kind(kind),
                    input_dim,
                    config,
                    num_classes,
                    vb.pp("branch"),
                )?,
                modality,
            })
        }
        ModelFamily::Fusion(objective) => SelectedModel::Fusion(FusionModel {
            text: transformer_branch(text_dim, "text")?,
            signal: transformer_branch(signal_dim, "signal")?,
            head: FusionHead::new(
                hidden,
                config.objectives.cca.outdim_size,
                num_classes,
                vb.pp("fusion_head"),
            )?,
            objective: objective.map(|k| PairObjective::from_config(k, &config.objectives)),
        }),
        ModelFamily::Alignment(objective) => SelectedModel::Alignment(AlignmentModel {
            text: transformer_branch(text_dim, "text")?,
            signal: transformer_branch(signal_dim, "signal")?,
            objective: PairObjective::from_config(objective, &config.objectives),
        }),
    };
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sample;
    use crate::loader::collate;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config(kind: ModelKind, modality: Option<Modality>) -> ExperimentConfig {
        let mut config = ExperimentConfig::from_preset("zuco-sa").unwrap();
        config.model.kind = kind;
        config.model.modality = modality;
        let arch = &mut config.model.architecture;
        arch.d_model = 8;
        arch.d_inner = 16;
        arch.hidden_dim = 6;
        arch.num_layers = 1;
        arch.num_heads = 2;
        arch.patch_width = 4;
        config.objectives.cca.outdim_size = 3;
        config
    }

    fn batch() -> Batch {
        let samples: Vec<Sample> = (0..5)
            .map(|i| Sample {
                row_id: i,
                text: (0..12).map(|j| (i * j) as f32 / 10.0).collect(),
                signal: (0..7).map(|j| (i + j) as f32 / 10.0).collect(),
                label: i % 3,
            })
            .collect();
        let refs: Vec<&Sample> = samples.iter().collect();
        collate(&refs, &Device::Cpu).unwrap()
    }

    fn build(config: &ExperimentConfig) -> Result<SelectedModel> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        select_model(config, 12, 7, 3, vb)
    }

    #[test]
    fn test_single_models_use_selected_modality() {
        let kinds = [
            ModelKind::Transformer,
            ModelKind::BiLstm,
            ModelKind::Mlp,
            ModelKind::ResNet,
        ];
        for kind in kinds {
            for modality in [Modality::Text, Modality::Eeg] {
                let model = build(&small_config(kind, Some(modality))).unwrap();
                let SelectedModel::Single(single) = model else {
                    panic!("{kind} should be single");
                };
                assert_eq!(single.modality(), modality);
                let logits = single.forward(&batch(), false).unwrap();
                assert_eq!(logits.dims(), &[5, 3]);
            }
        }
    }

    #[test]
    fn test_fusion_model_shapes() {
        let model = build(&small_config(ModelKind::CcaFusion, None)).unwrap();
        let SelectedModel::Fusion(fusion) = model else {
            panic!("expected fusion");
        };
        assert_eq!(fusion.objective().map(PairObjective::name), Some("cca"));
        let out = fusion.forward(&batch(), true).unwrap();
        assert_eq!(out.head.logits.dims(), &[5, 3]);
        assert_eq!(out.head.text.dims(), &[5, 3]);
        assert_eq!(out.text.logits.dims(), &[5, 3]);
        assert_eq!(out.signal.latent.dims(), &[5, 6]);
    }

    #[test]
    fn test_plain_fusion_has_no_objective() {
        let model = build(&small_config(ModelKind::Fusion, Some(Modality::Fusion))).unwrap();
        let SelectedModel::Fusion(fusion) = model else {
            panic!("expected fusion");
        };
        assert!(fusion.objective().is_none());
    }

    #[test]
    fn test_alignment_probabilities_are_mean_of_softmaxes() {
        let model = build(&small_config(ModelKind::WdAlignment, None)).unwrap();
        let SelectedModel::Alignment(alignment) = model else {
            panic!("expected alignment");
        };
        assert_eq!(alignment.objective().name(), "wasserstein");
        let out = alignment.forward(&batch(), false).unwrap();
        let probs = out.probabilities().unwrap();
        let sums = probs.sum(1).unwrap().to_vec1::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_invalid_combinations_rejected() {
        assert!(matches!(
            build(&small_config(ModelKind::Mlp, Some(Modality::Fusion))),
            Err(FusionError::Config(_))
        ));
        assert!(matches!(
            build(&small_config(ModelKind::CcaAlignment, Some(Modality::Eeg))),
            Err(FusionError::Config(_))
        ));
    }

    #[test]
    fn test_single_class_rejected() {
        let config = small_config(ModelKind::Mlp, Some(Modality::Text));
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(select_model(&config, 12, 7, 1, vb).is_err());
    }

    #[test]
    fn test_declared_class_count_must_match_labels() {
        let mut config = small_config(ModelKind::Mlp, Some(Modality::Eeg));
        config.model.architecture.num_classes = Some(5);
        assert!(matches!(build(&config), Err(FusionError::Config(_))));

        config.model.architecture.num_classes = Some(3);
        assert!(build(&config).is_ok());
    }
}
