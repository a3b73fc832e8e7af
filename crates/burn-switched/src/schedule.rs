//! Temperature annealing
//!
//! Temperature falls linearly from `1 + initial_temp` at step 0 to 1 at
//! `final_step` and stays at 1 afterwards. An optional heightened phase then
//! keeps sharpening below 1, reaching `heightened_temp_min` at
//! `heightened_final_step`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitchError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSchedule {
    /// Temperature added on top of 1 at step 0
    pub initial_temp: f64,
    /// Step at which the linear phase reaches 1
    pub final_step: u64,
    /// Temperature reached at the end of the heightened phase
    pub heightened_temp_min: f64,
    /// Last step of the heightened phase; disabled unless greater than
    /// `final_step`
    pub heightened_final_step: Option<u64>,
}

impl Default for TemperatureSchedule {
    fn default() -> Self {
        Self {
            initial_temp: 20.0,
            final_step: 50_000,
            heightened_temp_min: 1.0,
            heightened_final_step: Some(50_000),
        }
    }
}

impl TemperatureSchedule {
    pub fn validate(&self) -> Result<()> {
        if self.final_step == 0 {
            return Err(SwitchError::InvalidConfig(
                "temperature final step must be positive".into(),
            ));
        }
        if !(self.initial_temp.is_finite() && self.initial_temp >= 0.0) {
            return Err(SwitchError::InvalidTemperature(self.initial_temp));
        }
        if !(self.heightened_temp_min.is_finite() && self.heightened_temp_min > 0.0) {
            return Err(SwitchError::InvalidTemperature(self.heightened_temp_min));
        }
        Ok(())
    }

    /// Temperature at step 0
    pub fn start(&self) -> f64 {
        1.0 + self.initial_temp
    }

    /// Length of the heightened phase, if active
    fn heightened_span(&self) -> Option<u64> {
        match self.heightened_final_step {
            Some(end) if end > 1 && end > self.final_step => Some(end - self.final_step),
            _ => None,
        }
    }

    pub fn temperature_at(&self, step: u64) -> f64 {
        let final_step = self.final_step.max(1);

        if step > final_step {
            if let Some(span) = self.heightened_span() {
                let frac = (step - final_step).min(span) as f64 / span as f64;
                return 1.0 / (1.0 + (1.0 / self.heightened_temp_min - 1.0) * frac);
            }
            return 1.0;
        }

        let remaining = (final_step - step) as f64 / final_step as f64;
        (1.0 + self.initial_temp * remaining).max(1.0)
    }
}
