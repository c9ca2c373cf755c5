// Timeouts, serial settings, runtime configuration
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::motor::{ControllerMode, Direction};

// Protocol timing, in byte-time polls (1us each)
pub const MAX_RESPONSE_TIME_US: u32 = 1000;
pub const PING_TIMEOUT_US: u32 = 50;
pub const BYTE_DELAY_US: u32 = 1;

// Serial port for the sensorimotor bus
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
// Read timeout of the port; reads only ever ask for bytes already buffered
pub const SERIAL_TIMEOUT_MS: u64 = 10;

// Control loop frequency
pub const LOOP_HZ: u64 = 100;

// Consecutive faulted cycles before the channel is reported as faulted
pub const FAULT_WATCHDOG_CYCLES: u32 = 10;

// Log a channel report every N cycles
pub const REPORT_INTERVAL: u64 = 100;

/// Error loading the runtime configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Runtime settings for one motor channel.
/// Missing fields in a config file fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub port: String,
    pub baudrate: u32,
    pub motor_id: u8,
    pub direction: Direction,
    pub mode: ControllerMode,
    pub target_voltage: f64,
    pub target_position: f64,
    pub target_csl_mode: f64,
    pub target_csl_feedback: f64,
    pub limit_low: f64,
    pub limit_high: f64,
    pub proportional_gain: f64,
    pub disable_angle: f64,
    pub loop_hz: u64,
    /// Stop after this many cycles (runs until Ctrl-C when unset)
    pub cycles: Option<u64>,
    /// Use a simulated motor instead of the serial port
    pub simulate: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            motor_id: 1,
            direction: Direction::Forward,
            mode: ControllerMode::Disabled,
            target_voltage: 0.0,
            target_position: 0.0,
            target_csl_mode: 0.0,
            target_csl_feedback: 1.03,
            limit_low: -0.8,
            limit_high: 0.8,
            proportional_gain: 0.8,
            disable_angle: 0.90,
            loop_hz: LOOP_HZ,
            cycles: None,
            simulate: false,
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg = RuntimeConfig::from_json(
            r#"{ "motor_id": 12, "direction": "reverse", "mode": "csl", "target_csl_mode": 0.5 }"#,
        )
        .unwrap();
        assert_eq!(cfg.motor_id, 12);
        assert_eq!(cfg.direction, Direction::Reverse);
        assert_eq!(cfg.mode, ControllerMode::Csl);
        assert_eq!(cfg.target_csl_mode, 0.5);
        assert_eq!(cfg.baudrate, DEFAULT_BAUDRATE);
        assert_eq!(cfg.disable_angle, 0.90);
        assert_eq!(cfg.cycles, None);
    }

    #[test]
    fn test_invalid_config_is_error() {
        let err = RuntimeConfig::from_json(r#"{ "mode": "turbo" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
