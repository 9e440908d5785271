//! Narrow interfaces to the hardware and network collaborators.
//!
//! The core never touches a register, socket or file directly. Everything it
//! needs from the outside world goes through one of these traits, so the same
//! state machine runs against real peripherals, the in-process simulator, or
//! the scripted doubles in [`crate::sim`].

use crate::node::NodeState;
use std::time::{Duration, Instant};

/// Size of one radio frame on the air.
pub const FRAME_LEN: usize = 32;

pub type Frame = [u8; FRAME_LEN];

/// Monotonic millisecond clock plus a blocking delay.
///
/// Every bounded wait in the crate is a deadline loop over this trait rather
/// than a call into a particular runtime's sleep.
pub trait MonotonicClock {
    /// Milliseconds since boot. Never decreases.
    fn millis(&self) -> u64;

    /// Block the caller for `ms` milliseconds.
    fn delay_ms(&self, ms: u64);
}

/// Host clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { boot: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn millis(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    fn delay_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// The transceiver stopped answering on its control bus.
    NotResponding,
}

/// Half-duplex point-to-point transceiver (nRF24-style).
pub trait Radio {
    /// Bring up the transceiver and listen on `rx_address`.
    fn init(&mut self, channel: u8, rx_address: u64) -> bool;

    fn start_listening(&mut self);

    fn stop_listening(&mut self);

    fn open_writing_pipe(&mut self, address: u64);

    /// Transmit one frame on the current writing pipe. With `want_ack` the
    /// call only succeeds when the peer acknowledged the frame.
    fn write(&mut self, frame: &Frame, want_ack: bool) -> bool;

    /// Pop one frame from the RX FIFO, `WouldBlock` when it is empty.
    fn read(&mut self) -> nb::Result<Frame, RadioError>;
}

pub trait Accelerometer {
    fn init(&mut self) -> bool;

    /// One raw sample, counts per axis.
    fn read_acceleration(&mut self) -> (i16, i16, i16);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage not ready")]
    NotReady,
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Persistent storage for sample files and the log-number counter.
pub trait Storage {
    fn init(&mut self) -> bool;

    /// Last persisted log number, 0 when none was ever written.
    fn load_log_number(&mut self) -> i16;

    fn persist_log_number(&mut self, log_number: i16);

    /// Create (or truncate) a file.
    fn create_file(&mut self, name: &str) -> Result<(), StorageError>;

    fn append_line(&mut self, name: &str, line: &str) -> Result<(), StorageError>;

    fn read_file(&mut self, name: &str) -> Result<Vec<u8>, StorageError>;
}

/// Visual status indication.
pub trait Indicator {
    fn init(&mut self) -> bool;

    fn set_state(&mut self, state: NodeState);

    /// Error pulse shown when a command is rejected.
    fn show_error(&mut self);
}

/// Network link bring-up (WiFi association on the gateway).
pub trait NetworkLink {
    fn is_connected(&self) -> bool;

    /// One association attempt.
    fn connect(&mut self) -> bool;
}

/// Message broker session.
pub trait Broker {
    fn is_connected(&self) -> bool;

    /// One connect attempt; subscribes to `subscribe_topic` on success.
    fn connect(&mut self, client_id: &str, subscribe_topic: &str) -> bool;

    fn publish(&mut self, topic: &str, text: &str) -> bool;

    /// Next message received on the subscribed topic, if any.
    fn poll(&mut self) -> Option<String>;
}

/// External reference time service.
pub trait TimeSource {
    /// Seconds since the Unix epoch, `None` when the service did not answer.
    fn fetch_epoch_seconds(&mut self) -> Option<u64>;
}

/// Gateway-only collaborators.
pub struct Uplink {
    pub network: Box<dyn NetworkLink + Send>,
    pub broker: Box<dyn Broker + Send>,
    pub time_source: Box<dyn TimeSource + Send>,
}

/// Everything a node needs besides its radio and clock.
pub struct Peripherals {
    pub imu: Box<dyn Accelerometer + Send>,
    pub storage: Box<dyn Storage + Send>,
    pub indicator: Box<dyn Indicator + Send>,
    pub uplink: Option<Uplink>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.millis();
        clock.delay_ms(2);
        let b = clock.millis();
        assert!(b >= a + 2);
    }
}
