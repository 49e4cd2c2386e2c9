//! Per-family forward, loss and update rules.
//!
//! The engine drives every family through [`TrainingStrategy`]; the strategy
//! is chosen once per run from the selected model.

use candle_core::{Tensor, D};
use candle_nn::loss::cross_entropy;

use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::loader::Batch;
use crate::model::{
    AlignmentModel, AlignmentOutput, FusionModel, FusionOutput, SelectedModel, SingleModel,
};
use crate::optimizer::ScheduledOptimizer;

/// Forward outputs of one batch.
#[derive(Debug, Clone)]
pub enum StrategyOutput {
    /// Single-branch logits.
    Single(Tensor),
    /// Fusion branches and head.
    Fusion(FusionOutput),
    /// Aligned branches.
    Alignment(AlignmentOutput),
}

impl StrategyOutput {
    /// Class scores used for prediction.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn scores(&self) -> Result<Tensor> {
        Ok(match self {
            StrategyOutput::Single(logits) => logits.clone(),
            StrategyOutput::Fusion(out) => out.head.logits.clone(),
            StrategyOutput::Alignment(out) => out.probabilities()?,
        })
    }

    /// Argmax class per sample.
    ///
    /// # Errors
    ///
    /// Propagates candle errors.
    pub fn predictions(&self) -> Result<Vec<usize>> {
        let predicted = self.scores()?.argmax(D::Minus1)?.to_vec1::<u32>()?;
        Ok(predicted.into_iter().map(|p| p as usize).collect())
    }
}

/// Loss of one batch.
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Scalar loss that is backpropagated.
    pub total: Tensor,
    /// Unweighted fusion/alignment objective, when the family has one.
    pub objective: Option<Tensor>,
}

/// Forward/loss/update rule of one model family.
pub trait TrainingStrategy {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Run the model on a batch.
    ///
    /// # Errors
    ///
    /// Propagates model errors.
    fn forward_batch(&self, batch: &Batch, train: bool) -> Result<StrategyOutput>;

    /// Loss for a forward output.
    ///
    /// # Errors
    ///
    /// Propagates objective and candle errors.
    fn compute_loss(&self, output: &StrategyOutput, batch: &Batch) -> Result<LossBreakdown>;

    /// Backpropagate and update parameters once.
    ///
    /// # Errors
    ///
    /// Propagates optimizer errors.
    fn step(&self, loss: &LossBreakdown, optimizer: &mut ScheduledOptimizer) -> Result<()> {
        optimizer.step_and_update_lr(&loss.total)
    }
}

fn unexpected(strategy: &str) -> crate::error::FusionError {
    crate::error::FusionError::config(format!("{strategy} strategy received a foreign output"))
}

/// Cross-entropy on one branch.
pub struct RawStrategy {
    model: SingleModel,
}

impl RawStrategy {
    /// Strategy over a single-modality model.
    #[must_use]
    pub fn new(model: SingleModel) -> Self {
        Self { model }
    }
}

impl TrainingStrategy for RawStrategy {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn forward_batch(&self, batch: &Batch, train: bool) -> Result<StrategyOutput> {
        Ok(StrategyOutput::Single(self.model.forward(batch, train)?))
    }

    fn compute_loss(&self, output: &StrategyOutput, batch: &Batch) -> Result<LossBreakdown> {
        let StrategyOutput::Single(logits) = output else {
            return Err(unexpected(self.name()));
        };
        Ok(LossBreakdown {
            total: cross_entropy(logits, &batch.labels)?,
            objective: None,
        })
    }
}

/// Joint, text and signal cross-entropy plus a weighted consistency term.
pub struct FusionStrategy {
    model: FusionModel,
    weight: f64,
}

impl FusionStrategy {
    /// Strategy over a fusion model; `weight` scales the objective.
    #[must_use]
    pub fn new(model: FusionModel, weight: f64) -> Self {
        Self { model, weight }
    }
}

impl TrainingStrategy for FusionStrategy {
    fn name(&self) -> &'static str {
        "fusion"
    }

    fn forward_batch(&self, batch: &Batch, train: bool) -> Result<StrategyOutput> {
        Ok(StrategyOutput::Fusion(self.model.forward(batch, train)?))
    }

    fn compute_loss(&self, output: &StrategyOutput, batch: &Batch) -> Result<LossBreakdown> {
        let StrategyOutput::Fusion(out) = output else {
            return Err(unexpected(self.name()));
        };
        let joint = cross_entropy(&out.head.logits, &batch.labels)?;
        let text = cross_entropy(&out.text.logits, &batch.labels)?;
        let signal = cross_entropy(&out.signal.logits, &batch.labels)?;
        let mut total = joint.add(&text)?.add(&signal)?;

        let objective = match self.model.objective() {
            Some(objective) => {
                let value = objective.loss(&out.head.text, &out.head.signal)?;
                total = total.add(&value.affine(self.weight, 0.0)?)?;
                Some(value)
            }
            None => None,
        };
        Ok(LossBreakdown { total, objective })
    }
}

/// Two cross-entropies plus a weighted alignment penalty.
pub struct AlignmentStrategy {
    model: AlignmentModel,
    weight: f64,
    detach_text: bool,
}

impl AlignmentStrategy {
    /// Strategy over an alignment model.
    ///
    /// With `detach_text` the text latent is a fixed anchor for the penalty
    /// and only the signal branch is pulled towards it.
    #[must_use]
    pub fn new(model: AlignmentModel, weight: f64, detach_text: bool) -> Self {
        Self {
            model,
            weight,
            detach_text,
        }
    }

    /// Unweighted alignment penalty between the two latents.
    ///
    /// # Errors
    ///
    /// Propagates objective errors.
    pub fn penalty(&self, output: &AlignmentOutput) -> Result<Tensor> {
        let text = if self.detach_text {
            output.text.latent.detach()
        } else {
            output.text.latent.clone()
        };
        self.model.objective().loss(&text, &output.signal.latent)
    }
}

impl TrainingStrategy for AlignmentStrategy {
    fn name(&self) -> &'static str {
        "alignment"
    }

    fn forward_batch(&self, batch: &Batch, train: bool) -> Result<StrategyOutput> {
        Ok(StrategyOutput::Alignment(self.model.forward(batch, train)?))
    }

    fn compute_loss(&self, output: &StrategyOutput, batch: &Batch) -> Result<LossBreakdown> {
        let StrategyOutput::Alignment(out) = output else {
            return Err(unexpected(self.name()));
        };
        let text = cross_entropy(&out.text.logits, &batch.labels)?;
        let signal = cross_entropy(&out.signal.logits, &batch.labels)?;
        let penalty = self.penalty(out)?;
        let total = text.add(&signal)?.add(&penalty.affine(self.weight, 0.0)?)?;
        Ok(LossBreakdown {
            total,
            objective: Some(penalty),
        })
    }
}

/// Strategy for the selected model.
#[must_use]
pub fn build_strategy(model: SelectedModel, config: &ExperimentConfig) -> Box<dyn TrainingStrategy> {
    let objectives = &config.objectives;
    match model {
        SelectedModel::Single(m) => Box::new(RawStrategy::new(m)),
        SelectedModel::Fusion(m) => Box::new(FusionStrategy::new(m, objectives.fusion_weight)),
        SelectedModel::Alignment(m) => Box::new(AlignmentStrategy::new(
            m,
            objectives.alignment_weight,
            objectives.detach_text_latent,
        )),
    }
}
