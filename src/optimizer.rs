//! AdamW wrapped with a learning-rate schedule.
//!
//! There is no gradient reset: candle builds a fresh gradient store on every
//! backward pass.

use candle_core::Tensor;
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::config::TrainingConfig;
use crate::error::{FusionError, Result};
use crate::scheduler::{LRScheduler, SchedulerType};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.98,
            weight_decay: 0.01,
            eps: 1e-4,
        }
    }
}

impl From<&TrainingConfig> for OptimizerConfig {
    fn from(training: &TrainingConfig) -> Self {
        Self {
            beta1: training.beta1,
            beta2: training.beta2,
            weight_decay: training.weight_decay,
            eps: training.eps,
        }
    }
}

impl OptimizerConfig {
    /// Create a scheduled AdamW optimizer over every variable in `varmap`.
    ///
    /// The initial learning rate is the schedule's value at step 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build_scheduled(
        &self,
        varmap: &VarMap,
        schedule: SchedulerType,
    ) -> Result<ScheduledOptimizer> {
        let scheduler = LRScheduler::new(schedule);
        let params = ParamsAdamW {
            lr: scheduler.get_lr(),
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        };

        let inner = candle_nn::AdamW::new(varmap.all_vars(), params)
            .map_err(|e| FusionError::config(format!("Failed to create AdamW: {e}")))?;

        Ok(ScheduledOptimizer { inner, scheduler })
    }
}

/// AdamW whose learning rate follows an [`LRScheduler`].
pub struct ScheduledOptimizer {
    inner: candle_nn::AdamW,
    scheduler: LRScheduler,
}

impl ScheduledOptimizer {
    /// Advance the schedule, set the new learning rate, then backpropagate
    /// `loss` and apply the AdamW update. No gradient clipping.
    ///
    /// # Errors
    ///
    /// Returns an error if the backward pass or the update fails.
    pub fn step_and_update_lr(&mut self, loss: &Tensor) -> Result<()> {
        let lr = self.scheduler.step();
        self.inner.set_learning_rate(lr);
        self.inner.backward_step(loss)?;
        Ok(())
    }

    /// Number of optimizer steps taken.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.scheduler.current_step()
    }

    /// Get current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    #[test]
    fn test_optimizer_config_default() {
        let config = OptimizerConfig::default();
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.98);
        assert_eq!(config.eps, 1e-4);
        assert_eq!(config.weight_decay, 0.01);
    }

    #[test]
    fn test_build_starts_at_zero_lr() -> Result<()> {
        let varmap = VarMap::new();
        let optimizer = OptimizerConfig::default().build_scheduled(
            &varmap,
            SchedulerType::WarmupInverseSqrt {
                d_model: 16,
                warmup_steps: 10,
            },
        )?;
        assert_eq!(optimizer.learning_rate(), 0.0);
        assert_eq!(optimizer.step_count(), 0);
        Ok(())
    }

    #[test]
    fn test_step_updates_lr_and_parameters() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let w = varmap.get((1,), "w", Init::Const(1.0), DType::F32, &device)?;

        let mut optimizer = OptimizerConfig {
            weight_decay: 0.0,
            ..OptimizerConfig::default()
        }
        .build_scheduled(&varmap, SchedulerType::Constant { base_lr: 0.1 })?;

        let loss = w.sqr()?.sum_all()?;
        optimizer.step_and_update_lr(&loss)?;

        assert_eq!(optimizer.step_count(), 1);
        assert!((optimizer.learning_rate() - 0.1).abs() < 1e-12);
        let after = w.to_vec1::<f32>()?[0];
        assert!(after < 1.0, "parameter should move against the gradient");
        Ok(())
    }
}
