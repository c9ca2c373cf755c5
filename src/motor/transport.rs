// Byte channel used by the sensorimotor protocol
//
// The protocol core only talks to a `ByteChannel`: an inbound byte queue with a
// running checksum, an outbound buffer, and a blocking micro-wait. Two channels
// are provided: `SerialChannel` (real hardware) and `MemoryChannel` (tests and
// simulation).

use serialport::{self, SerialPort};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{DEFAULT_BAUDRATE, SERIAL_TIMEOUT_MS};

/// Error types for sensorimotor communication
#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection to motor {id} lost: sent {sent} of {expected} bytes")]
    ConnectionLost { id: u8, sent: usize, expected: usize },
}

pub type Result<T> = std::result::Result<T, MotorError>;

/// 8-bit additive checksum.
///
/// The trailing byte of a frame is the two's complement of the byte sum, so a
/// frame is intact when the sum over everything since the reset, checksum byte
/// included, is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum(u8);

impl Checksum {
    pub fn reset(&mut self) {
        self.0 = 0;
    }

    pub fn push(&mut self, byte: u8) {
        self.0 = self.0.wrapping_add(byte);
    }

    /// Byte to append so that the frame sums to zero
    pub fn value(&self) -> u8 {
        self.0.wrapping_neg()
    }

    pub fn is_valid(&self) -> bool {
        self.0 == 0
    }

    /// Checksum byte for a run of bytes
    pub fn of(bytes: &[u8]) -> u8 {
        let mut sum = Self::default();
        bytes.iter().for_each(|&b| sum.push(b));
        sum.value()
    }
}

/// Contract between the protocol core and the underlying transport.
///
/// Cycles for different motors sharing one channel must be serialized by the
/// caller: the core assumes it owns the inbound queue for a whole cycle.
pub trait ByteChannel {
    /// Append bytes to the outbound buffer
    fn enqueue_bytes(&mut self, bytes: &[u8]);

    /// Transmit the outbound buffer, returning how many bytes went out
    fn send_enqueued(&mut self) -> Result<usize>;

    /// Peek at the oldest received byte
    fn front_byte(&self) -> Option<u8>;

    /// Drop the oldest received byte without touching the checksum
    fn pop_byte(&mut self);

    /// Consume the oldest received byte, feeding it into the checksum
    fn take_byte(&mut self) -> Option<u8>;

    fn queue_len(&self) -> usize;

    fn queue_empty(&self) -> bool {
        self.queue_len() == 0
    }

    fn reset_checksum(&mut self);

    fn checksum_valid(&self) -> bool;

    /// Block for `us` microseconds
    fn wait_micros(&mut self, us: u32);

    /// Move whatever the transport has received into the queue, without blocking
    fn poll_transport(&mut self);

    /// Consume a big-endian 16-bit word
    fn take_word(&mut self) -> Option<u16> {
        let hi = self.take_byte()?;
        let lo = self.take_byte()?;
        Some(u16::from_be_bytes([hi, lo]))
    }
}

/// Inbound queue shared by both channel implementations
#[derive(Debug, Default)]
struct RxQueue {
    bytes: VecDeque<u8>,
    checksum: Checksum,
}

impl RxQueue {
    fn take(&mut self) -> Option<u8> {
        let byte = self.bytes.pop_front()?;
        self.checksum.push(byte);
        Some(byte)
    }
}

/// Sensorimotor bus on a serial port
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    rx: RxQueue,
    tx: Vec<u8>,
    read_buf: Vec<u8>,
}

impl SerialChannel {
    /// Open a new connection to the motor bus
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        debug!("Opened {} at {} baud", port_name, baudrate);

        Ok(Self {
            port,
            rx: RxQueue::default(),
            tx: Vec::with_capacity(8),
            read_buf: vec![0u8; 256],
        })
    }

    fn read_available(&mut self) -> Result<usize> {
        let available = self.port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(0);
        }
        if self.read_buf.len() < available {
            self.read_buf.resize(available, 0);
        }
        let n = self.port.read(&mut self.read_buf[..available])?;
        self.rx.bytes.extend(&self.read_buf[..n]);
        Ok(n)
    }
}

impl ByteChannel for SerialChannel {
    fn enqueue_bytes(&mut self, bytes: &[u8]) {
        self.tx.extend_from_slice(bytes);
    }

    fn send_enqueued(&mut self) -> Result<usize> {
        let result = self.port.write(&self.tx);
        let expected = self.tx.len();
        self.tx.clear();
        let sent = result?;
        self.port.flush()?;
        if sent < expected {
            warn!("Short write: {} of {} bytes", sent, expected);
        }
        Ok(sent)
    }

    fn front_byte(&self) -> Option<u8> {
        self.rx.bytes.front().copied()
    }

    fn pop_byte(&mut self) {
        self.rx.bytes.pop_front();
    }

    fn take_byte(&mut self) -> Option<u8> {
        self.rx.take()
    }

    fn queue_len(&self) -> usize {
        self.rx.bytes.len()
    }

    fn reset_checksum(&mut self) {
        self.rx.checksum.reset();
    }

    fn checksum_valid(&self) -> bool {
        self.rx.checksum.is_valid()
    }

    fn wait_micros(&mut self, us: u32) {
        spin_sleep::sleep(Duration::from_micros(us as u64));
    }

    fn poll_transport(&mut self) {
        if let Err(e) = self.read_available() {
            warn!("Failed to read from serial port: {}", e);
        }
    }
}

/// Computes the bytes a simulated motor sends back for a received frame
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// In-memory channel with a virtual microsecond clock.
///
/// Bytes can be injected right away or scheduled to arrive after a number of
/// waited microseconds, which makes partial frames and silence reproducible.
/// An optional responder plays the motor side of the link.
pub struct MemoryChannel {
    rx: RxQueue,
    tx: Vec<u8>,
    scheduled: VecDeque<(u64, Vec<u8>)>,
    clock_us: u64,
    sent: Vec<Vec<u8>>,
    responder: Option<Responder>,
    response_delay_us: u64,
    write_limit: Option<usize>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self {
            rx: RxQueue::default(),
            tx: Vec::new(),
            scheduled: VecDeque::new(),
            clock_us: 0,
            sent: Vec::new(),
            responder: None,
            response_delay_us: 0,
            write_limit: None,
        }
    }

    /// Answer every sent frame with the responder's bytes, `delay_us` later
    pub fn with_responder(responder: Responder, delay_us: u64) -> Self {
        Self {
            responder: Some(responder),
            response_delay_us: delay_us,
            ..Self::new()
        }
    }

    /// Make bytes available to the next `poll_transport`
    pub fn inject(&mut self, bytes: &[u8]) {
        self.deliver_after(0, bytes);
    }

    /// Make bytes available once `delay_us` more microseconds have been waited
    pub fn deliver_after(&mut self, delay_us: u64, bytes: &[u8]) {
        let due = self.clock_us + delay_us;
        let at = self
            .scheduled
            .iter()
            .position(|(t, _)| *t > due)
            .unwrap_or(self.scheduled.len());
        self.scheduled.insert(at, (due, bytes.to_vec()));
    }

    /// Cap how many bytes a single send may write
    pub fn set_write_limit(&mut self, limit: Option<usize>) {
        self.write_limit = limit;
    }

    /// Frames sent so far, oldest first
    pub fn sent_frames(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub fn clock_us(&self) -> u64 {
        self.clock_us
    }
}

impl ByteChannel for MemoryChannel {
    fn enqueue_bytes(&mut self, bytes: &[u8]) {
        self.tx.extend_from_slice(bytes);
    }

    fn send_enqueued(&mut self) -> Result<usize> {
        let frame = std::mem::take(&mut self.tx);
        let sent = self.write_limit.map_or(frame.len(), |l| l.min(frame.len()));
        if let Some(responder) = self.responder.as_mut() {
            let reply = responder(&frame[..sent]);
            if !reply.is_empty() {
                let delay = self.response_delay_us;
                self.deliver_after(delay, &reply);
            }
        }
        self.sent.push(frame);
        Ok(sent)
    }

    fn front_byte(&self) -> Option<u8> {
        self.rx.bytes.front().copied()
    }

    fn pop_byte(&mut self) {
        self.rx.bytes.pop_front();
    }

    fn take_byte(&mut self) -> Option<u8> {
        self.rx.take()
    }

    fn queue_len(&self) -> usize {
        self.rx.bytes.len()
    }

    fn reset_checksum(&mut self) {
        self.rx.checksum.reset();
    }

    fn checksum_valid(&self) -> bool {
        self.rx.checksum.is_valid()
    }

    fn wait_micros(&mut self, us: u32) {
        self.clock_us += us as u64;
    }

    fn poll_transport(&mut self) {
        while let Some((due, _)) = self.scheduled.front() {
            if *due > self.clock_us {
                break;
            }
            if let Some((_, bytes)) = self.scheduled.pop_front() {
                self.rx.bytes.extend(bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_of_frame_sums_to_zero() {
        let body = [0xC0u8, 0x07];
        let chk = Checksum::of(&body);
        assert_eq!(chk, 0x39); // -(0xC7) mod 256

        let mut sum = Checksum::default();
        for b in body.iter().chain(std::iter::once(&chk)) {
            sum.push(*b);
        }
        assert!(sum.is_valid());
    }

    #[test]
    fn test_take_byte_feeds_checksum_pop_does_not() {
        let mut ch = MemoryChannel::new();
        ch.inject(&[0x10, 0xF0, 0x55]);
        ch.poll_transport();
        ch.reset_checksum();

        assert_eq!(ch.take_byte(), Some(0x10));
        assert_eq!(ch.take_byte(), Some(0xF0));
        assert!(ch.checksum_valid());

        ch.pop_byte();
        assert!(ch.checksum_valid());
        assert!(ch.queue_empty());
        assert_eq!(ch.take_byte(), None);
    }

    #[test]
    fn test_take_word_is_big_endian() {
        let mut ch = MemoryChannel::new();
        ch.inject(&[0x02, 0x00]);
        ch.poll_transport();
        assert_eq!(ch.take_word(), Some(512));
    }

    #[test]
    fn test_scheduled_bytes_arrive_with_clock() {
        let mut ch = MemoryChannel::new();
        ch.deliver_after(3, &[0xAA]);
        ch.inject(&[0x01]);

        ch.poll_transport();
        assert_eq!(ch.queue_len(), 1);

        ch.wait_micros(2);
        ch.poll_transport();
        assert_eq!(ch.queue_len(), 1);

        ch.wait_micros(1);
        ch.poll_transport();
        assert_eq!(ch.queue_len(), 2);
    }

    #[test]
    fn test_responder_and_write_limit() {
        let responder: Responder = Box::new(|frame| vec![frame.len() as u8]);
        let mut ch = MemoryChannel::with_responder(responder, 0);

        ch.enqueue_bytes(&[1, 2, 3]);
        assert_eq!(ch.send_enqueued().unwrap(), 3);
        ch.poll_transport();
        assert_eq!(ch.front_byte(), Some(3));

        ch.set_write_limit(Some(1));
        ch.enqueue_bytes(&[1, 2, 3]);
        assert_eq!(ch.send_enqueued().unwrap(), 1);
        assert_eq!(ch.sent_frames().len(), 2);
    }
}
