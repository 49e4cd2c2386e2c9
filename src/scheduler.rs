//! Learning rate schedulers.

use crate::config::{LrSchedule, TrainingConfig};

/// Learning rate scheduler types.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant {
        /// Learning rate returned for every step
        base_lr: f64,
    },
    /// Linear warmup then inverse square-root decay, scaled by `d_model^-0.5`
    WarmupInverseSqrt {
        /// Model width the schedule is scaled by
        d_model: usize,
        /// Step at which the schedule peaks
        warmup_steps: usize,
    },
}

impl SchedulerType {
    /// Scheduler described by the training configuration.
    #[must_use]
    pub fn from_config(training: &TrainingConfig, d_model: usize) -> Self {
        match training.lr_schedule {
            LrSchedule::Constant => SchedulerType::Constant {
                base_lr: training.learning_rate,
            },
            LrSchedule::WarmupInverseSqrt => SchedulerType::WarmupInverseSqrt {
                d_model,
                warmup_steps: training.warmup_steps,
            },
        }
    }
}

/// Learning rate scheduler.
///
/// The step counter only grows; each training batch advances it by one.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    scheduler_type: SchedulerType,
    current_step: usize,
}

impl LRScheduler {
    /// Create a new scheduler at step 0.
    #[must_use]
    pub fn new(scheduler_type: SchedulerType) -> Self {
        Self {
            scheduler_type,
            current_step: 0,
        }
    }

    /// Number of steps taken so far.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Learning rate for the current step.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        self.lr_at(self.current_step)
    }

    /// Learning rate at an arbitrary step.
    #[must_use]
    pub fn lr_at(&self, step: usize) -> f64 {
        match self.scheduler_type {
            SchedulerType::Constant { base_lr } => base_lr,
            SchedulerType::WarmupInverseSqrt {
                d_model,
                warmup_steps,
            } => warmup_inverse_sqrt(step, d_model, warmup_steps),
        }
    }

    /// Advance one step and return the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.get_lr()
    }
}

/// `d_model^-0.5 * min(n^-0.5, n * warmup^-1.5)`, zero at step 0.
fn warmup_inverse_sqrt(step: usize, d_model: usize, warmup_steps: usize) -> f64 {
    if step == 0 {
        return 0.0;
    }
    let n = step as f64;
    let warmup = warmup_steps.max(1) as f64;
    (d_model as f64).powf(-0.5) * n.powf(-0.5).min(n * warmup.powf(-1.5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noam(d_model: usize, warmup_steps: usize) -> LRScheduler {
        LRScheduler::new(SchedulerType::WarmupInverseSqrt {
            d_model,
            warmup_steps,
        })
    }

    #[test]
    fn test_constant_scheduler() {
        let mut scheduler = LRScheduler::new(SchedulerType::Constant { base_lr: 1e-3 });
        assert_eq!(scheduler.get_lr(), 1e-3);
        assert_eq!(scheduler.step(), 1e-3);
    }

    #[test]
    fn test_zero_at_step_zero() {
        assert_eq!(noam(64, 400).get_lr(), 0.0);
    }

    #[test]
    fn test_warmup_increases_then_decays() {
        let scheduler = noam(64, 100);

        for step in 1..100 {
            assert!(
                scheduler.lr_at(step) < scheduler.lr_at(step + 1),
                "lr must grow during warmup at step {step}"
            );
        }
        for step in 100..1000 {
            assert!(
                scheduler.lr_at(step + 1) < scheduler.lr_at(step),
                "lr must decay after warmup at step {step}"
            );
        }

        let peak = scheduler.lr_at(100);
        assert!(peak > scheduler.lr_at(99));
        assert!(peak > scheduler.lr_at(101));
    }

    #[test]
    fn test_peak_value() {
        let scheduler = noam(64, 400);
        let expected = 64f64.powf(-0.5) * 400f64.powf(-0.5);
        assert!((scheduler.lr_at(400) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_step_advances_counter() {
        let mut scheduler = noam(16, 4);
        let first = scheduler.step();
        assert_eq!(scheduler.current_step(), 1);
        assert!((first - scheduler.lr_at(1)).abs() < 1e-15);
        scheduler.step();
        assert_eq!(scheduler.current_step(), 2);
    }

    #[test]
    fn test_from_config() {
        let mut training = TrainingConfig::default();
        assert_eq!(
            SchedulerType::from_config(&training, 32),
            SchedulerType::WarmupInverseSqrt {
                d_model: 32,
                warmup_steps: training.warmup_steps
            }
        );
        training.lr_schedule = LrSchedule::Constant;
        assert_eq!(
            SchedulerType::from_config(&training, 32),
            SchedulerType::Constant {
                base_lr: training.learning_rate
            }
        );
    }
}
