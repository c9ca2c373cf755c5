// Sensorimotor serial protocol: frame encoding and payload decoding
//
// Frame format: [0xFF, 0xFF, Command, ID, Payload..., Checksum]
// The checksum covers everything after the sync pair. Replies use the same
// layout; multi-byte fields are big-endian 16-bit words.

use serde::{Deserialize, Serialize};

use super::transport::Checksum;

/// Sync byte, sent twice at the start of every frame
pub const SYNC: u8 = 0xFF;

/// Command opcodes (host -> motor)
pub const CMD_SET_VOLTAGE_POS: u8 = 0xB0;
pub const CMD_SET_VOLTAGE_NEG: u8 = 0xB1;
pub const CMD_DATA_REQUEST: u8 = 0xC0;
pub const CMD_TOGGLE_OUTPUT: u8 = 0xD0;
pub const CMD_PING: u8 = 0xE0;

/// Reply opcodes (motor -> host)
pub const REPLY_STATE_DATA: u8 = 0x80;
pub const REPLY_PING: u8 = 0xE1;

/// cmd + id + 5 words + checksum
pub const STATE_DATA_LEN: usize = 13;
/// cmd + id + checksum
pub const PING_REPLY_LEN: usize = 3;

/// Vmax = 13V -> 1023
pub const VOLTAGE_SCALE: f64 = 0.012713472;
/// Imax = 3.3A -> 1023
pub const CURRENT_SCALE: f64 = 0.003225806;

/// PWM above 128/255 is ignored by the motor firmware
pub const MAX_VOLTAGE: f64 = 0.5;

/// Mounting direction of a motor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }
}

/// Outgoing commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Ping,
    DataRequest,
    /// Wire voltage: already clamped and direction-corrected
    SetVoltage(f64),
    /// Toggles the motor's status output. Part of the protocol, not used by
    /// the control surface.
    ToggleOutput,
}

impl Command {
    /// Build a voltage command: clamp to `MAX_VOLTAGE`, then apply direction
    pub fn set_voltage(voltage: f64, direction: Direction) -> Self {
        Command::SetVoltage(clip_symmetric(voltage, MAX_VOLTAGE) * direction.sign())
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::Ping => CMD_PING,
            Command::DataRequest => CMD_DATA_REQUEST,
            Command::SetVoltage(v) if *v >= 0.0 => CMD_SET_VOLTAGE_POS,
            Command::SetVoltage(_) => CMD_SET_VOLTAGE_NEG,
            Command::ToggleOutput => CMD_TOGGLE_OUTPUT,
        }
    }

    fn payload(&self) -> Option<u8> {
        match self {
            Command::SetVoltage(v) => Some(pwm_byte(*v)),
            _ => None,
        }
    }

    /// Encode into a complete frame for motor `id`
    pub fn encode(&self, id: u8) -> Vec<u8> {
        let mut frame = Vec::with_capacity(6);
        frame.extend_from_slice(&[SYNC, SYNC]);
        frame.push(self.opcode());
        frame.push(id);
        frame.extend(self.payload());

        let checksum = Checksum::of(&frame[2..]); // skip sync pair
        frame.push(checksum);
        frame
    }
}

/// PWM duty byte for a wire voltage, never above the `MAX_VOLTAGE` ceiling
fn pwm_byte(voltage: f64) -> u8 {
    (clip_symmetric(voltage, MAX_VOLTAGE).abs() * 255.0).round() as u8
}

/// Decoded payload of a state-data reply
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StateData {
    pub position: f64,
    pub current: f64,
    pub voltage_backemf: f64,
    pub voltage_supply: f64,
    pub temperature: f64,
}

impl StateData {
    /// Decode the five raw words of a state-data reply.
    /// Position is returned already corrected by `direction`.
    pub fn from_words(words: [u16; 5], direction: Direction) -> Self {
        let [position, current, backemf, supply, temperature] = words;
        Self {
            position: signed_centered(position) * direction.sign(),
            current: current as f64 * CURRENT_SCALE,
            voltage_backemf: signed_centered(backemf),
            voltage_supply: supply as f64 * VOLTAGE_SCALE,
            temperature: temperature as i16 as f64 / 100.0,
        }
    }
}

/// Latest known sensor values of a motor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub output_voltage: f64,
    pub position: f64,
    pub current: f64,
    pub voltage_backemf: f64,
    pub voltage_supply: f64,
    pub temperature: f64,
}

impl SensorSnapshot {
    /// Overwrite every measured field; the commanded output voltage is kept
    pub fn apply(&mut self, data: &StateData) {
        *self = Self {
            output_voltage: self.output_voltage,
            position: data.position,
            current: data.current,
            voltage_backemf: data.voltage_backemf,
            voltage_supply: data.voltage_supply,
            temperature: data.temperature,
        };
    }
}

/// Map a 10-bit sample centered at 512 to approx. [-1, 1]
pub fn signed_centered(word: u16) -> f64 {
    (word as f64 - 512.0) / 512.0
}

/// Inverse of `signed_centered`, saturating to the 16-bit range
pub fn centered_word(value: f64) -> u16 {
    (value * 512.0 + 512.0).round().clamp(0.0, u16::MAX as f64) as u16
}

pub fn clip(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

pub fn clip_symmetric(value: f64, bound: f64) -> f64 {
    clip(value, -bound, bound)
}

pub fn positive_part(value: f64) -> f64 {
    value.max(0.0)
}

pub fn negative_part(value: f64) -> f64 {
    value.min(0.0)
}

/// `p` times the positive part plus `n` times the negative part
pub fn asymmetric_gain(value: f64, p: f64, n: f64) -> f64 {
    p * positive_part(value) + n * negative_part(value)
}

/// Build a state-data reply frame, as a motor would send it
pub fn encode_state_reply(id: u8, words: [u16; 5]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + STATE_DATA_LEN);
    frame.extend_from_slice(&[SYNC, SYNC, REPLY_STATE_DATA, id]);
    for word in words {
        frame.extend_from_slice(&word.to_be_bytes());
    }
    let checksum = Checksum::of(&frame[2..]);
    frame.push(checksum);
    frame
}

/// Build a ping reply frame, as a motor would send it
pub fn encode_ping_reply(id: u8) -> Vec<u8> {
    vec![SYNC, SYNC, REPLY_PING, id, Checksum::of(&[REPLY_PING, id])]
}
