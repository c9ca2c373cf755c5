// Fixed-rate control loop with fault watchdog
// Each tick runs one full communication cycle, then evaluates the controller
// so the next cycle sends the updated target.

use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

// local imports
use crate::config::{FAULT_WATCHDOG_CYCLES, REPORT_INTERVAL, RuntimeConfig};
use crate::messages::{ChannelHealth, ChannelReport};
use crate::motor::protocol::{
    CMD_DATA_REQUEST, CMD_PING, CMD_SET_VOLTAGE_NEG, CMD_SET_VOLTAGE_POS, VOLTAGE_SCALE,
    centered_word, encode_ping_reply, encode_state_reply,
};
use crate::motor::{
    ByteChannel, ControlState, CycleStatistics, MemoryChannel, MotorChannel, MotorError, Responder,
    SerialChannel,
};

/// Reply latency of the simulated motor
const SIM_RESPONSE_DELAY_US: u64 = 150;
/// Position change per cycle at full voltage
const SIM_POSITION_RATE: f64 = 0.05;

pub struct Runtime<C> {
    motor: MotorChannel<C>,
    cycle: u64,
    faulted_streak: u32,
    health: ChannelHealth,
}

impl<C: ByteChannel> Runtime<C> {
    pub fn new(motor: MotorChannel<C>) -> Self {
        Self {
            motor,
            cycle: 0,
            faulted_streak: 0,
            health: ChannelHealth::Ok,
        }
    }

    pub fn motor(&self) -> &MotorChannel<C> {
        &self.motor
    }

    pub fn health(&self) -> ChannelHealth {
        self.health
    }

    /// Run one cycle and evaluate the controller on the result
    pub fn step(&mut self) -> Result<CycleStatistics, MotorError> {
        let stats = self.motor.run_cycle()?;
        self.motor.evaluate_control();
        self.cycle += 1;
        self.update_health(&stats);
        Ok(stats)
    }

    /// Watchdog: report the link as faulted after a run of faulted cycles
    fn update_health(&mut self, stats: &CycleStatistics) {
        if stats.faulted {
            self.faulted_streak += 1;
        } else {
            self.faulted_streak = 0;
        }

        if self.faulted_streak >= FAULT_WATCHDOG_CYCLES {
            if self.health != ChannelHealth::Faulted {
                warn!(
                    "Motor {} faulted for {} cycles ({} timeouts, {} errors)",
                    self.motor.id(),
                    self.faulted_streak,
                    stats.timeout_count,
                    stats.error_count
                );
            }
            self.health = ChannelHealth::Faulted;
        } else if self.faulted_streak == 0 && self.health == ChannelHealth::Faulted {
            info!("Motor {} responding again", self.motor.id());
            self.health = ChannelHealth::Ok;
        }
    }

    pub fn report(&self) -> ChannelReport {
        ChannelReport {
            motor_id: self.motor.id(),
            cycle: self.cycle,
            mode: self.motor.mode(),
            health: self.health,
            snapshot: *self.motor.snapshot(),
            statistics: *self.motor.statistics(),
        }
    }

    /// Leave the output stage off: disable and send a final data request
    pub fn shutdown(&mut self) -> Result<(), MotorError> {
        info!("Disabling motor {}", self.motor.id());
        self.motor.disable();
        self.motor.run_cycle()?;
        Ok(())
    }

    /// Best-effort shutdown after a failed cycle
    pub fn fail_safe(&mut self, cause: &MotorError) {
        warn!("Motor {} cycle failed: {}", self.motor.id(), cause);
        if let Err(e) = self.shutdown() {
            warn!(
                "Could not disable motor {}, output stage may still be powered: {}",
                self.motor.id(),
                e
            );
        }
    }
}

/// Tick period for `loop_hz`, at least 1us
pub fn loop_period(loop_hz: u64) -> Duration {
    Duration::from_micros((1_000_000 / loop_hz.max(1)).max(1))
}

/// Build a motor channel from the runtime settings
pub fn motor_from_config<C: ByteChannel>(channel: C, config: &RuntimeConfig) -> MotorChannel<C> {
    let control = ControlState {
        target_position: config.target_position,
        target_csl_mode: config.target_csl_mode,
        target_csl_feedback: config.target_csl_feedback,
        limit_low: config.limit_low,
        limit_high: config.limit_high,
        proportional_gain: config.proportional_gain,
        disable_angle: config.disable_angle,
        ..ControlState::default()
    };
    let mut motor = MotorChannel::with_control(config.motor_id, channel, control);
    motor.set_direction(config.direction);
    motor.set_target_voltage(config.target_voltage);
    motor
}

/// Motor model for `--simulate`: integrates the commanded voltage into
/// position and answers requests addressed to `id`.
pub fn simulated_motor(id: u8) -> Responder {
    let mut position = 0.0f64;
    let mut voltage = 0.0f64;

    Box::new(move |frame: &[u8]| {
        let (Some(&cmd), Some(&target)) = (frame.get(2), frame.get(3)) else {
            return Vec::new();
        };
        if target != id {
            return Vec::new();
        }
        match cmd {
            CMD_PING => return encode_ping_reply(id),
            CMD_SET_VOLTAGE_POS | CMD_SET_VOLTAGE_NEG => {
                let pwm = frame.get(4).copied().unwrap_or(0) as f64 / 255.0;
                voltage = if cmd == CMD_SET_VOLTAGE_NEG { -pwm } else { pwm };
            }
            CMD_DATA_REQUEST => voltage = 0.0,
            _ => return Vec::new(),
        }

        position = (position + SIM_POSITION_RATE * voltage).clamp(-1.0, 1.0);
        let supply = (12.0 / VOLTAGE_SCALE).round() as u16;
        let temperature = 2500u16; // 25.0 C
        encode_state_reply(id, [centered_word(position), 0, centered_word(voltage), supply, temperature])
    })
}

pub async fn run(config: RuntimeConfig, ping_only: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if config.simulate {
        info!("Using simulated motor {}", config.motor_id);
        let channel = MemoryChannel::with_responder(simulated_motor(config.motor_id), SIM_RESPONSE_DELAY_US);
        run_channel(channel, &config, ping_only).await
    } else {
        info!("Opening motor bus on {} at {} baud", config.port, config.baudrate);
        let channel = SerialChannel::open_with_baudrate(&config.port, config.baudrate)?;
        run_channel(channel, &config, ping_only).await
    }
}

async fn run_channel<C: ByteChannel>(
    channel: C,
    config: &RuntimeConfig,
    ping_only: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut motor = motor_from_config(channel, config);

    if motor.ping()? {
        info!("Motor {} responding", motor.id());
    } else {
        warn!("Motor {} not responding to ping", motor.id());
    }
    if ping_only {
        return Ok(());
    }

    motor.set_mode(config.mode);
    let mut runtime = Runtime::new(motor);
    let mut tick = interval(loop_period(config.loop_hz));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        "Runtime started: {}Hz loop, motor {}, {:?} controller",
        config.loop_hz,
        config.motor_id,
        config.mode
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut shutdown => {
                info!("Interrupted, stopping");
                break;
            }
        }

        // 1. Cycle + controller
        if let Err(e) = runtime.step() {
            runtime.fail_safe(&e);
            return Err(e.into());
        }

        // 2. Periodic report
        if runtime.cycle % REPORT_INTERVAL == 0 {
            info!("{}", serde_json::to_string(&runtime.report())?);
        }

        if config.cycles.is_some_and(|limit| runtime.cycle >= limit) {
            info!("Completed {} cycles", runtime.cycle);
            break;
        }
    }

    runtime.shutdown()?;
    info!("{}", serde_json::to_string(&runtime.report())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{ControllerMode, Direction};

    fn simulated(config: &RuntimeConfig) -> Runtime<MemoryChannel> {
        let channel = MemoryChannel::with_responder(simulated_motor(config.motor_id), SIM_RESPONSE_DELAY_US);
        Runtime::new(motor_from_config(channel, config))
    }

    #[test]
    fn test_simulated_motor_answers_ping() {
        let config = RuntimeConfig::default();
        let channel = MemoryChannel::with_responder(simulated_motor(config.motor_id), 10);
        let mut motor = motor_from_config(channel, &config);
        assert!(motor.ping().unwrap());
    }

    #[test]
    fn test_simulated_voltage_moves_position() {
        let config = RuntimeConfig {
            mode: ControllerMode::Voltage,
            target_voltage: 0.4,
            ..Default::default()
        };
        let mut runtime = simulated(&config);
        runtime.motor.set_mode(config.mode);

        for _ in 0..5 {
            let stats = runtime.step().unwrap();
            assert!(!stats.faulted);
        }
        assert!(runtime.motor().snapshot().position > 0.05);
        assert_eq!(runtime.health(), ChannelHealth::Ok);
        assert!((runtime.motor().snapshot().voltage_supply - 12.0).abs() < 0.02);
    }

    #[test]
    fn test_position_mode_converges_in_simulation() {
        let config = RuntimeConfig {
            mode: ControllerMode::Position,
            target_position: 0.3,
            proportional_gain: 2.0,
            direction: Direction::Reverse,
            ..Default::default()
        };
        let mut runtime = simulated(&config);
        runtime.motor.set_mode(config.mode);

        for _ in 0..200 {
            runtime.step().unwrap();
        }
        let position = runtime.motor().snapshot().position;
        assert!((position - 0.3).abs() < 0.02, "position {}", position);
        assert_eq!(runtime.motor().mode(), ControllerMode::Position);
    }

    #[test]
    fn test_watchdog_faults_and_recovers() {
        let config = RuntimeConfig::default();
        let mut runtime = Runtime::new(motor_from_config(MemoryChannel::new(), &config));

        for _ in 0..FAULT_WATCHDOG_CYCLES - 1 {
            runtime.step().unwrap();
        }
        assert_eq!(runtime.health(), ChannelHealth::Ok);
        runtime.step().unwrap();
        assert_eq!(runtime.health(), ChannelHealth::Faulted);
        assert_eq!(runtime.report().statistics.timeout_count, FAULT_WATCHDOG_CYCLES);

        runtime
            .motor
            .channel_mut()
            .inject(&encode_state_reply(config.motor_id, [512; 5]));
        runtime.step().unwrap();
        assert_eq!(runtime.health(), ChannelHealth::Ok);
    }

    #[test]
    fn test_loop_period_never_zero() {
        assert_eq!(loop_period(100), Duration::from_millis(10));
        assert_eq!(loop_period(0), Duration::from_secs(1));
        assert_eq!(loop_period(2_000_000), Duration::from_micros(1));
    }

    #[test]
    fn test_fail_safe_after_short_write() {
        let config = RuntimeConfig {
            mode: ControllerMode::Voltage,
            target_voltage: 0.2,
            ..Default::default()
        };
        let mut runtime = simulated(&config);
        runtime.motor.set_mode(config.mode);
        runtime.motor.channel_mut().set_write_limit(Some(3));

        let err = runtime.step().unwrap_err();
        assert!(matches!(err, MotorError::ConnectionLost { .. }));

        // link comes back: the fail-safe disables and sends a data request
        runtime.motor.channel_mut().set_write_limit(None);
        runtime.fail_safe(&err);
        assert_eq!(runtime.motor().mode(), ControllerMode::Disabled);
        let frames = runtime.motor().channel().sent_frames();
        assert_eq!(frames.last().unwrap()[2], CMD_DATA_REQUEST);

        // link stays down: fail-safe only logs
        runtime.motor.channel_mut().set_write_limit(Some(0));
        runtime.fail_safe(&err);
    }

    #[test]
    fn test_shutdown_sends_data_request() {
        let config = RuntimeConfig {
            mode: ControllerMode::Voltage,
            target_voltage: 0.2,
            ..Default::default()
        };
        let mut runtime = simulated(&config);
        runtime.motor.set_mode(config.mode);
        runtime.step().unwrap();
        runtime.shutdown().unwrap();

        assert_eq!(runtime.motor().mode(), ControllerMode::Disabled);
        let frames = runtime.motor().channel().sent_frames();
        assert_eq!(frames[0][2], CMD_SET_VOLTAGE_POS);
        assert_eq!(frames.last().unwrap()[2], CMD_DATA_REQUEST);
    }
}
