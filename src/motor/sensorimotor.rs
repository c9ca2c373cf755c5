// Single motor channel
//
// Combines the frame codec, response parser, controller and statistics into
// one communication cycle per call to `run_cycle`.

use tracing::{debug, info, warn};

use super::control::{ControlState, ControllerMode};
use super::protocol::{Command, Direction, SensorSnapshot};
use super::response::{ParseState, Reply, ResponseParser};
use super::statistics::CycleStatistics;
use super::transport::{ByteChannel, MotorError, Result};
use crate::config::{MAX_RESPONSE_TIME_US, PING_TIMEOUT_US};

/// One motor on a byte channel.
///
/// Owns its snapshot, controller state and statistics. The snapshot only
/// changes when a reply with matching id and valid checksum arrives.
pub struct MotorChannel<C> {
    id: u8,
    channel: C,
    direction: Direction,
    do_request: bool,
    is_responding: bool,
    mode: ControllerMode,
    control: ControlState,
    snapshot: SensorSnapshot,
    statistics: CycleStatistics,
    parse_state: ParseState,
}

impl<C: ByteChannel> MotorChannel<C> {
    pub fn new(id: u8, channel: C) -> Self {
        Self::with_control(id, channel, ControlState::default())
    }

    /// Create with custom controller parameters
    pub fn with_control(id: u8, channel: C, control: ControlState) -> Self {
        Self {
            id,
            channel,
            direction: Direction::Forward,
            do_request: true,
            is_responding: false,
            mode: ControllerMode::Disabled,
            control,
            snapshot: SensorSnapshot::default(),
            statistics: CycleStatistics::default(),
            parse_state: ParseState::AwaitFirstSync,
        }
    }

    /// Check if the motor is reachable
    pub fn ping(&mut self) -> Result<bool> {
        self.is_responding = false;
        self.send(Command::Ping)?;
        self.receive_response(PING_TIMEOUT_US);
        debug!("Motor {} ping: {}", self.id, self.is_responding);
        Ok(self.is_responding)
    }

    /// Perform a full communication cycle: send the command for the current
    /// mode, then wait for the reply.
    ///
    /// With requests toggled off this does no I/O and returns zeroed statistics.
    pub fn run_cycle(&mut self) -> Result<CycleStatistics> {
        if !self.do_request {
            return Ok(CycleStatistics::default());
        }

        let command = if self.mode != ControllerMode::Disabled {
            Command::set_voltage(self.control.target_voltage, self.direction)
        } else {
            Command::DataRequest
        };
        self.send(command)?;
        Ok(self.receive_response(MAX_RESPONSE_TIME_US))
    }

    /// Run the control law on the current snapshot
    pub fn evaluate_control(&mut self) {
        let position = self.snapshot.position;
        if let Some(voltage) = self.control.evaluate(&mut self.mode, position) {
            self.snapshot.output_voltage = voltage;
        }
    }

    fn send(&mut self, command: Command) -> Result<()> {
        let frame = command.encode(self.id);
        self.channel.enqueue_bytes(&frame);
        self.channel.poll_transport(); // pick up whatever is left over
        let sent = self.channel.send_enqueued()?;
        if sent != frame.len() {
            return Err(MotorError::ConnectionLost {
                id: self.id,
                sent,
                expected: frame.len(),
            });
        }
        Ok(())
    }

    fn receive_response(&mut self, timeout_us: u32) -> CycleStatistics {
        let outcome = ResponseParser::new(self.id, self.direction).receive(&mut self.channel, timeout_us);
        self.parse_state = outcome.state;

        match outcome.reply {
            Some(Reply::StateData(data)) => self.snapshot.apply(&data),
            Some(Reply::Ping) => self.is_responding = true,
            None => {}
        }
        if outcome.timed_out {
            warn!("Timeout waiting for response from motor {}", self.id);
        } else if outcome.invalid {
            warn!("Invalid response from motor {}", self.id);
        }

        self.statistics
            .update(outcome.elapsed_us, outcome.timed_out, outcome.invalid);
        self.statistics
    }

    /// Get the motor ID
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Last known ping result
    pub fn is_active(&self) -> bool {
        self.is_responding
    }

    /// Parser state the last response wait ended in
    pub fn parse_state(&self) -> ParseState {
        self.parse_state
    }

    pub fn snapshot(&self) -> &SensorSnapshot {
        &self.snapshot
    }

    pub fn statistics(&self) -> &CycleStatistics {
        &self.statistics
    }

    pub fn reset_statistics(&mut self) {
        self.statistics = CycleStatistics::default();
    }

    pub fn mode(&self) -> ControllerMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ControllerMode) {
        if mode != self.mode {
            info!("Motor {}: controller {:?} -> {:?}", self.id, self.mode, mode);
        }
        self.mode = mode;
    }

    /// Turn the output stage off; only data requests are sent afterwards
    pub fn disable(&mut self) {
        self.set_mode(ControllerMode::Disabled);
    }

    /// Stop or resume communication in `run_cycle`
    pub fn toggle_request(&mut self) {
        self.do_request = !self.do_request;
    }

    pub fn is_requesting(&self) -> bool {
        self.do_request
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn control(&self) -> &ControlState {
        &self.control
    }

    pub fn set_proportional(&mut self, gain: f64) {
        self.control.proportional_gain = gain;
    }

    pub fn set_limits(&mut self, low: f64, high: f64) {
        self.control.limit_low = low;
        self.control.limit_high = high;
    }

    pub fn set_disable_angle(&mut self, angle: f64) {
        self.control.disable_angle = angle;
    }

    pub fn set_target_position(&mut self, position: f64) {
        self.control.target_position = position;
    }

    /// Also reported as the snapshot's output voltage
    pub fn set_target_voltage(&mut self, voltage: f64) {
        self.control.target_voltage = voltage;
        self.snapshot.output_voltage = voltage;
    }

    pub fn set_target_csl_mode(&mut self, mode: f64) {
        self.control.target_csl_mode = mode;
    }

    pub fn set_target_csl_feedback(&mut self, feedback: f64) {
        self.control.target_csl_feedback = feedback;
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::protocol::{
        CMD_DATA_REQUEST, CMD_PING, CMD_SET_VOLTAGE_NEG, encode_ping_reply, encode_state_reply,
    };
    use crate::motor::transport::MemoryChannel;

    const ID: u8 = 3;
    const WORDS: [u16; 5] = [640, 310, 512, 944, 2500];

    fn channel() -> MotorChannel<MemoryChannel> {
        MotorChannel::new(ID, MemoryChannel::new())
    }

    #[test]
    fn test_valid_frame_overwrites_snapshot() {
        let mut motor = channel();
        motor.channel_mut().deliver_after(20, &encode_state_reply(ID, WORDS));

        let stats = motor.run_cycle().unwrap();
        assert!(!stats.faulted);
        assert_eq!(motor.parse_state(), ParseState::Completed);
        assert_eq!(motor.snapshot().position, 0.25);
        assert_eq!(motor.snapshot().temperature, 25.0);
        assert_eq!(motor.channel().sent_frames()[0][2], CMD_DATA_REQUEST);
    }

    #[test]
    fn test_invalid_frame_keeps_snapshot() {
        let mut motor = channel();
        motor.channel_mut().inject(&encode_state_reply(ID, WORDS));
        motor.run_cycle().unwrap();
        let before = *motor.snapshot();

        let mut corrupt = encode_state_reply(ID, [900; 5]);
        corrupt[6] ^= 0x01;
        motor.channel_mut().inject(&corrupt);
        let stats = motor.run_cycle().unwrap();
        assert!(stats.faulted);
        assert_eq!(stats.error_count, 1);
        assert_eq!(*motor.snapshot(), before);

        motor.channel_mut().inject(&encode_state_reply(ID + 1, [900; 5]));
        let stats = motor.run_cycle().unwrap();
        assert_eq!(stats.error_count, 2);
        assert_eq!(*motor.snapshot(), before);
    }

    #[test]
    fn test_silence_counts_timeout() {
        let mut motor = channel();
        let stats = motor.run_cycle().unwrap();
        assert!(stats.faulted);
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.last_response_time_us, MAX_RESPONSE_TIME_US);
        assert_eq!(*motor.snapshot(), SensorSnapshot::default());
    }

    #[test]
    fn test_timeout_keeps_last_snapshot() {
        let mut motor = channel();
        motor.channel_mut().inject(&encode_state_reply(ID, WORDS));
        motor.run_cycle().unwrap();
        let before = *motor.snapshot();
        assert_ne!(before, SensorSnapshot::default());

        let stats = motor.run_cycle().unwrap();
        assert!(stats.faulted);
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(*motor.snapshot(), before);
    }

    #[test]
    fn test_ping() {
        let mut motor = channel();
        motor.channel_mut().deliver_after(5, &encode_ping_reply(ID));
        assert!(motor.ping().unwrap());
        assert!(motor.is_active());
        assert_eq!(motor.channel().sent_frames()[0][2], CMD_PING);

        // reply arrives after the ping budget
        motor.channel_mut().deliver_after(100, &encode_ping_reply(ID));
        assert!(!motor.ping().unwrap());
        assert!(!motor.is_active());
    }

    #[test]
    fn test_active_mode_sends_voltage() {
        let mut motor = channel();
        motor.set_direction(Direction::Reverse);
        motor.set_mode(ControllerMode::Voltage);
        motor.set_target_voltage(0.3);
        assert_eq!(motor.snapshot().output_voltage, 0.3);

        motor.run_cycle().unwrap();
        let frame = &motor.channel().sent_frames()[0];
        assert_eq!(frame[2], CMD_SET_VOLTAGE_NEG);
        assert_eq!(frame[3], ID);
        assert_eq!(frame[4], 77);
    }

    #[test]
    fn test_reverse_direction_flips_position() {
        let mut motor = channel();
        motor.set_direction(Direction::Reverse);
        motor.channel_mut().inject(&encode_state_reply(ID, WORDS));
        motor.run_cycle().unwrap();
        assert_eq!(motor.snapshot().position, -0.25);
    }

    #[test]
    fn test_short_write_is_connection_lost() {
        let mut motor = channel();
        motor.channel_mut().set_write_limit(Some(2));
        match motor.run_cycle() {
            Err(MotorError::ConnectionLost { id, sent, expected }) => {
                assert_eq!(id, ID);
                assert_eq!(sent, 2);
                assert_eq!(expected, 5);
            }
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
    }

    #[test]
    fn test_toggle_request_skips_io() {
        let mut motor = channel();
        motor.toggle_request();
        let stats = motor.run_cycle().unwrap();
        assert_eq!(stats, CycleStatistics::default());
        assert!(motor.channel().sent_frames().is_empty());
    }

    #[test]
    fn test_position_control_from_snapshot() {
        let mut motor = channel();
        motor.set_mode(ControllerMode::Position);
        motor.set_proportional(0.8);
        motor.set_target_position(0.2);
        motor.evaluate_control();
        assert!((motor.snapshot().output_voltage - 0.16).abs() < 1e-9);
        assert!((motor.control().target_voltage - 0.16).abs() < 1e-9);
    }

    #[test]
    fn test_disable_angle_on_next_evaluation() {
        let mut motor = channel();
        motor.set_mode(ControllerMode::Voltage);
        motor
            .channel_mut()
            .inject(&encode_state_reply(ID, [1000, 0, 512, 0, 0]));
        motor.run_cycle().unwrap();
        assert!(motor.snapshot().position > 0.9);

        motor.evaluate_control();
        assert_eq!(motor.mode(), ControllerMode::Disabled);

        motor.run_cycle().unwrap();
        assert_eq!(motor.channel().sent_frames()[1][2], CMD_DATA_REQUEST);
    }

    #[test]
    fn test_reset_statistics() {
        let mut motor = channel();
        motor.run_cycle().unwrap();
        assert_eq!(motor.statistics().timeout_count, 1);
        motor.reset_statistics();
        assert_eq!(*motor.statistics(), CycleStatistics::default());
    }
}
