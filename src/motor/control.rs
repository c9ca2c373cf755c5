// Control law evaluation
//
// Turns the latest position reading into a target voltage for the active
// controller mode. Runs once per cycle.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::protocol::{asymmetric_gain, clip, positive_part};

/// csl integrator gain for positive (contracting) modes
const CSL_GAIN_POS: f64 = 2.4;
/// csl integrator gain for negative (releasing) modes
const CSL_GAIN_NEG: f64 = 16.0;
/// Output scaling from csl control signal to voltage
const CSL_OUTPUT_SCALE: f64 = 0.75;

/// Controller modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ControllerMode {
    /// Output stage off, only data requests are sent
    #[default]
    Disabled,
    /// Target voltage is sent as-is
    Voltage,
    /// Proportional position control
    Position,
    /// Current-shaping limiter
    Csl,
}

/// Tunable parameters and persistent memory of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    /// Accumulated position error. Tracked and clamped in position mode
    /// but not part of the output.
    pub integral_error: f64,
    /// csl filter state
    pub z: f64,
    pub target_position: f64,
    pub target_voltage: f64,
    pub target_csl_mode: f64,
    pub target_csl_feedback: f64,
    pub limit_low: f64,
    pub limit_high: f64,
    pub proportional_gain: f64,
    pub disable_angle: f64,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            integral_error: 0.0,
            z: 0.0,
            target_position: 0.0,
            target_voltage: 0.0,
            target_csl_mode: 0.0,
            target_csl_feedback: 1.03,
            limit_low: -0.8,
            limit_high: 0.8,
            proportional_gain: 0.8,
            disable_angle: 0.90,
        }
    }
}

impl ControlState {
    /// Clamp into [limit_low, limit_high]
    pub fn clip(&self, value: f64) -> f64 {
        clip(value, self.limit_low, self.limit_high)
    }

    /// Evaluate one control step at `position`.
    ///
    /// Forces `mode` to `Disabled` when |position| reaches the disable angle.
    /// This is checked on every call; nothing re-enables the mode.
    ///
    /// Returns the new target voltage when the active mode computed one.
    pub fn evaluate(&mut self, mode: &mut ControllerMode, position: f64) -> Option<f64> {
        if position.abs() >= self.disable_angle {
            if *mode != ControllerMode::Disabled {
                warn!(
                    "Position {:.3} beyond disable angle {:.3}, disabling {:?} controller",
                    position, self.disable_angle, mode
                );
            }
            *mode = ControllerMode::Disabled;
        }

        let mut output = None;

        if *mode == ControllerMode::Position {
            let err = self.target_position - position;
            self.integral_error = self.clip(self.integral_error + err);
            output = Some(self.proportional_gain * err);
        } else {
            self.integral_error = 0.0;
        }

        let csl_mode = self.clip(self.target_csl_mode);
        let gi = asymmetric_gain(csl_mode, CSL_GAIN_POS, CSL_GAIN_NEG);
        let gf = self.target_csl_feedback * positive_part(csl_mode);

        if *mode == ControllerMode::Csl {
            if position > self.limit_high {
                self.z = self.z.min(gi * position);
            }
            if position < self.limit_low {
                self.z = self.z.max(gi * position);
            }

            let u = self.clip(-gi * position + self.z);
            self.z = gi * position + gf * u;
            output = Some(CSL_OUTPUT_SCALE * u);
        } else {
            // track so that entering csl starts from the current position
            self.z = gi * position;
        }

        if let Some(voltage) = output {
            self.target_voltage = voltage;
        }
        output
    }
}
