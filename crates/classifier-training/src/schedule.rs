//! Learning rate scheduling.
//!
//! Rates decay on the global iteration counter (one iteration per batch),
//! not per pass, and the counter keeps running across both training phases.

use classifier_core::{ConfigurationError, StepScheduleConfig};
use serde::{Deserialize, Serialize};

/// Step decay: `initial_rate * decay_rate^(iteration / step)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSchedule {
    initial_rate: f64,
    decay_rate: f64,
    step: usize,
}

impl StepSchedule {
    pub fn new(initial_rate: f64, decay_rate: f64, step: usize) -> Result<Self, ConfigurationError> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(initial_rate) || !positive(decay_rate) || step == 0 {
            return Err(ConfigurationError::InvalidArchitecture(format!(
                "step schedule needs positive rate, decay and step, got {initial_rate}/{decay_rate}/{step}"
            )));
        }
        Ok(Self {
            initial_rate,
            decay_rate,
            step,
        })
    }

    /// A schedule that never decays
    pub fn constant(rate: f64) -> Self {
        Self {
            initial_rate: rate,
            decay_rate: 1.0,
            step: usize::MAX,
        }
    }

    pub fn from_config(config: &StepScheduleConfig) -> Result<Self, ConfigurationError> {
        Self::new(config.initial_rate, config.decay_rate, config.step)
    }

    pub fn initial_rate(&self) -> f64 {
        self.initial_rate
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Rate in effect for the given (zero-based) iteration
    pub fn learning_rate(&self, iteration: usize) -> f64 {
        let decays = (iteration / self.step) as i32;
        self.initial_rate * self.decay_rate.powi(decays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_decay() {
        let schedule = StepSchedule::new(1e-2, 0.1, 100).unwrap();

        assert!((schedule.learning_rate(0) - 1e-2).abs() < 1e-12);
        assert!((schedule.learning_rate(99) - 1e-2).abs() < 1e-12);
        assert!((schedule.learning_rate(100) - 1e-3).abs() < 1e-12);
        assert!((schedule.learning_rate(250) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_reference_schedule_is_flat_for_short_runs() {
        let schedule = StepSchedule::new(2e-2, 0.1, 100_000).unwrap();
        // 110 passes over 80 images in batches of 10 stay far below one step
        assert_eq!(schedule.learning_rate(880), 2e-2);
    }

    #[test]
    fn test_constant() {
        let schedule = StepSchedule::constant(0.5);
        assert_eq!(schedule.learning_rate(0), 0.5);
        assert_eq!(schedule.learning_rate(10_000_000), 0.5);
    }

    #[test]
    fn test_invalid() {
        assert!(StepSchedule::new(0.0, 0.1, 10).is_err());
        assert!(StepSchedule::new(0.1, 0.1, 0).is_err());
        assert!(StepSchedule::new(0.1, -1.0, 10).is_err());
    }
}
