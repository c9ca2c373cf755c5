// Per-channel communication statistics

use serde::{Deserialize, Serialize};

/// Smoothing factor of the response time moving average
const AVG_SMOOTHING: f64 = 0.01;

/// Running outcome counters of a motor channel.
/// Only reset on request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleStatistics {
    /// Invalid frames (bad checksum, foreign id, unknown command)
    pub error_count: u32,
    pub timeout_count: u32,
    pub last_response_time_us: u32,
    pub avg_response_time_us: f64,
    pub max_response_time_us: u32,
    /// Whether the most recent cycle timed out or was invalid
    pub faulted: bool,
}

impl CycleStatistics {
    pub fn update(&mut self, elapsed_us: u32, timed_out: bool, invalid: bool) {
        if invalid {
            self.error_count += 1;
        }
        if timed_out {
            self.timeout_count += 1;
        }
        self.faulted = timed_out || invalid;
        self.last_response_time_us = elapsed_us;
        self.avg_response_time_us =
            (1.0 - AVG_SMOOTHING) * self.avg_response_time_us + AVG_SMOOTHING * elapsed_us as f64;
        self.max_response_time_us = self.max_response_time_us.max(elapsed_us);
    }
}
