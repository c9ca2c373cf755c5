// Closed-loop runtime for a sensorimotor actuator on a half-duplex serial link

pub mod config;
pub mod messages;
pub mod motor;
pub mod runtime;
