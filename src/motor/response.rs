// Response state machine
//
// Reassembles a reply from the inbound queue one step at a time. Bytes may
// arrive in any chunking; position-in-frame tracking decides whether 0xFF is a
// sync marker or payload.

use tracing::debug;

use super::protocol::{
    Direction, PING_REPLY_LEN, REPLY_PING, REPLY_STATE_DATA, STATE_DATA_LEN, StateData, SYNC,
};
use super::transport::ByteChannel;
use crate::config::BYTE_DELAY_US;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseState {
    #[default]
    AwaitFirstSync,
    AwaitSecondSync,
    Processing,
    Completed,
    Invalid,
}

impl ParseState {
    pub fn is_pending(self) -> bool {
        !matches!(self, ParseState::Completed | ParseState::Invalid)
    }
}

/// Result of a single parse step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Progress was made, step again
    Continue,
    /// Nothing more to do until new bytes arrive (or the frame is finished)
    Wait,
}

/// A reply that completed with matching id and valid checksum
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    StateData(StateData),
    Ping,
}

/// What one response wait produced
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseOutcome {
    pub state: ParseState,
    pub elapsed_us: u32,
    pub timed_out: bool,
    pub invalid: bool,
    pub reply: Option<Reply>,
}

/// Parser for a single reply from motor `motor_id`
#[derive(Debug, Clone)]
pub struct ResponseParser {
    motor_id: u8,
    direction: Direction,
    state: ParseState,
    reply: Option<Reply>,
}

impl ResponseParser {
    pub fn new(motor_id: u8, direction: Direction) -> Self {
        Self {
            motor_id,
            direction,
            state: ParseState::AwaitFirstSync,
            reply: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Advance by at most one transition
    pub fn step<C: ByteChannel + ?Sized>(&mut self, chan: &mut C) -> Step {
        chan.poll_transport();

        match self.state {
            ParseState::AwaitFirstSync => {
                let Some(byte) = chan.front_byte() else {
                    return Step::Wait;
                };
                if byte == SYNC {
                    // sync bytes are popped: the checksum covers command onwards
                    chan.reset_checksum();
                    chan.pop_byte();
                    self.state = ParseState::AwaitSecondSync;
                } else {
                    // scan for the start of a frame
                    chan.pop_byte();
                }
                Step::Continue
            }

            ParseState::AwaitSecondSync => {
                let Some(byte) = chan.front_byte() else {
                    return Step::Wait;
                };
                chan.pop_byte();
                self.state = if byte == SYNC {
                    ParseState::Processing
                } else {
                    ParseState::AwaitFirstSync
                };
                Step::Continue
            }

            ParseState::Processing => {
                let Some(cmd) = chan.front_byte() else {
                    return Step::Wait;
                };
                match cmd {
                    REPLY_STATE_DATA => {
                        if chan.queue_len() < STATE_DATA_LEN {
                            return Step::Wait;
                        }
                        let frame = take_state_data(chan);
                        let direction = self.direction;
                        let reply = frame.and_then(|(id, words)| {
                            self.accept(chan, id)
                                .then(|| Reply::StateData(StateData::from_words(words, direction)))
                        });
                        self.finish(reply);
                        Step::Continue
                    }
                    REPLY_PING => {
                        if chan.queue_len() < PING_REPLY_LEN {
                            return Step::Wait;
                        }
                        let frame = take_ping(chan);
                        let reply = frame.and_then(|id| self.accept(chan, id).then_some(Reply::Ping));
                        self.finish(reply);
                        Step::Continue
                    }
                    other => {
                        debug!("Motor {}: unknown reply command 0x{:02X}", self.motor_id, other);
                        self.state = ParseState::Invalid;
                        Step::Wait
                    }
                }
            }

            ParseState::Completed | ParseState::Invalid => Step::Wait,
        }
    }

    /// Wait for a full reply, polling at most `timeout_us` byte times
    pub fn receive<C: ByteChannel + ?Sized>(&mut self, chan: &mut C, timeout_us: u32) -> ResponseOutcome {
        self.state = ParseState::AwaitFirstSync;
        self.reply = None;

        let mut elapsed_us = 0;
        loop {
            while self.step(chan) == Step::Continue {}
            elapsed_us += 1;
            if elapsed_us >= timeout_us || !self.state.is_pending() {
                break;
            }
            chan.wait_micros(BYTE_DELAY_US);
        }

        ResponseOutcome {
            state: self.state,
            elapsed_us,
            timed_out: self.state.is_pending(),
            invalid: self.state == ParseState::Invalid,
            reply: self.reply,
        }
    }

    fn accept<C: ByteChannel + ?Sized>(&self, chan: &C, id: u8) -> bool {
        if id != self.motor_id {
            debug!("Reply for motor {} while waiting for motor {}", id, self.motor_id);
            return false;
        }
        if !chan.checksum_valid() {
            debug!("Checksum mismatch for motor {}", self.motor_id);
            return false;
        }
        true
    }

    fn finish(&mut self, reply: Option<Reply>) {
        self.state = if reply.is_some() {
            ParseState::Completed
        } else {
            ParseState::Invalid
        };
        self.reply = reply;
    }
}

/// Consume command, id, five words and checksum of a state-data reply
fn take_state_data<C: ByteChannel + ?Sized>(chan: &mut C) -> Option<(u8, [u16; 5])> {
    chan.take_byte()?;
    let id = chan.take_byte()?;
    let mut words = [0u16; 5];
    for word in &mut words {
        *word = chan.take_word()?;
    }
    chan.take_byte()?;
    Some((id, words))
}

/// Consume command, id and checksum of a ping reply
fn take_ping<C: ByteChannel + ?Sized>(chan: &mut C) -> Option<u8> {
    chan.take_byte()?;
    let id = chan.take_byte()?;
    chan.take_byte()?;
    Some(id)
}
