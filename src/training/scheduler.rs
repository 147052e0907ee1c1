//! Learning Rate Scheduler Module
//!
//! Schedules are stepped explicitly by the trainers: Stage 1 and the
//! self-training Stage 2 step once per epoch, FixMatch steps once per
//! optimizer step.

use serde::{Deserialize, Serialize};

/// Learning rate schedule relative to a base learning rate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LrSchedule {
    /// Constant learning rate
    Constant,

    /// Multiply by `gamma` every `step_size` steps: `lr0 * gamma^(step / step_size)`
    Step { step_size: usize, gamma: f64 },

    /// Multiply by `gamma` at each listed step
    MultiStep { milestones: Vec<usize>, gamma: f64 },

    /// Linear warmup, then `max(0, cos(pi * num_cycles * progress))`
    WarmupCosine {
        warmup_steps: usize,
        total_steps: usize,
        num_cycles: f64,
    },
}

impl LrSchedule {
    /// The cosine schedule commonly used for FixMatch (7/16 of a cycle)
    pub fn fixmatch_cosine(total_steps: usize) -> Self {
        Self::WarmupCosine {
            warmup_steps: 0,
            total_steps,
            num_cycles: 7.0 / 16.0,
        }
    }

    /// Multiplier applied to the base learning rate after `step` scheduler steps
    pub fn factor(&self, step: usize) -> f64 {
        match self {
            Self::Constant => 1.0,

            Self::Step { step_size, gamma } => {
                let step_size = (*step_size).max(1);
                gamma.powi((step / step_size) as i32)
            }

            Self::MultiStep { milestones, gamma } => {
                let passed = milestones.iter().filter(|&&m| step >= m).count();
                gamma.powi(passed as i32)
            }

            Self::WarmupCosine {
                warmup_steps,
                total_steps,
                num_cycles,
            } => {
                if step < *warmup_steps {
                    return step as f64 / (*warmup_steps).max(1) as f64;
                }
                let span = total_steps.saturating_sub(*warmup_steps).max(1);
                let progress = (step - warmup_steps) as f64 / span as f64;
                (std::f64::consts::PI * num_cycles * progress).cos().max(0.0)
            }
        }
    }
}

impl Default for LrSchedule {
    fn default() -> Self {
        Self::Constant
    }
}

/// A schedule bound to a base learning rate and a step counter
#[derive(Debug, Clone)]
pub struct LrScheduler {
    schedule: LrSchedule,
    base_lr: f64,
    steps: usize,
}

impl LrScheduler {
    pub fn new(schedule: LrSchedule, base_lr: f64) -> Self {
        Self {
            schedule,
            base_lr,
            steps: 0,
        }
    }

    /// Current learning rate
    pub fn lr(&self) -> f64 {
        self.base_lr * self.schedule.factor(self.steps)
    }

    /// Advance the schedule by one step and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.steps += 1;
        self.lr()
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let mut scheduler = LrScheduler::new(LrSchedule::Constant, 0.1);
        scheduler.step();
        assert_eq!(scheduler.lr(), 0.1);
    }

    #[test]
    fn test_step_decay_matches_step_lr() {
        let mut scheduler = LrScheduler::new(
            LrSchedule::Step {
                step_size: 2,
                gamma: 0.1,
            },
            1.0,
        );
        assert_eq!(scheduler.lr(), 1.0);
        assert_eq!(scheduler.step(), 1.0);
        assert!((scheduler.step() - 0.1).abs() < 1e-12);
        assert!((scheduler.step() - 0.1).abs() < 1e-12);
        assert!((scheduler.step() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_multi_step() {
        let schedule = LrSchedule::MultiStep {
            milestones: vec![3, 5],
            gamma: 0.5,
        };
        assert_eq!(schedule.factor(2), 1.0);
        assert_eq!(schedule.factor(3), 0.5);
        assert_eq!(schedule.factor(6), 0.25);
    }

    #[test]
    fn test_fixmatch_cosine_never_negative() {
        let schedule = LrSchedule::fixmatch_cosine(100);
        assert_eq!(schedule.factor(0), 1.0);
        assert!(schedule.factor(50) < 1.0);
        assert!(schedule.factor(100) > 0.0);
        assert!(schedule.factor(1000) >= 0.0);
    }

    #[test]
    fn test_warmup_is_linear() {
        let schedule = LrSchedule::WarmupCosine {
            warmup_steps: 4,
            total_steps: 20,
            num_cycles: 0.5,
        };
        assert_eq!(schedule.factor(2), 0.5);
        assert_eq!(schedule.factor(4), 1.0);
    }
}
