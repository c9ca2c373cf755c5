// Reports emitted by the runtime

use serde::{Deserialize, Serialize};

use crate::motor::{ControllerMode, CycleStatistics, SensorSnapshot};

/// Link health of a motor channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelHealth {
    Ok,
    Faulted,
}

/// Periodic status of a motor channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReport {
    pub motor_id: u8,
    pub cycle: u64,
    pub mode: ControllerMode,
    pub health: ChannelHealth,
    pub snapshot: SensorSnapshot,
    pub statistics: CycleStatistics,
}
