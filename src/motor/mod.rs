// Sensorimotor control module
//
// Provides:
// - Byte channel contract with serial and in-memory implementations
// - Sensorimotor frame codec and response state machine
// - Control law (voltage / position / csl) and link statistics
// - Per-motor channel API tying them together

pub mod control;
pub mod protocol;
pub mod response;
mod sensorimotor;
pub mod statistics;
pub mod transport;

pub use control::{ControlState, ControllerMode};
pub use protocol::{Command, Direction, SensorSnapshot};
pub use response::ParseState;
pub use sensorimotor::MotorChannel;
pub use statistics::CycleStatistics;
pub use transport::{ByteChannel, MemoryChannel, MotorError, Responder, SerialChannel};
