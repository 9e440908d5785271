//! Point-to-point radio messaging: the fixed 32-byte frame, half-duplex
//! send/receive with deadlines, retrying request/reply, and the boot-time
//! node-liveness / log-number exchange.

use crate::config::RadioConfig;
use crate::hal::{Frame, MonotonicClock, Radio, Storage, FRAME_LEN};
use crate::node::NodeStatusTable;
use arrayvec::ArrayString;
use static_assertions::const_assert_eq;
use tracing::{debug, info, warn};

/// Payload field width on the air, including the terminating NUL.
pub const PAYLOAD_FIELD_LEN: usize = 22;
/// Longest payload text that still leaves room for the NUL.
pub const PAYLOAD_CAPACITY: usize = PAYLOAD_FIELD_LEN - 1;

const_assert_eq!(2 + PAYLOAD_FIELD_LEN + 8, FRAME_LEN);

const PAYLOAD_OFFSET: usize = 2;
const TIMESTAMP_OFFSET: usize = PAYLOAD_OFFSET + PAYLOAD_FIELD_LEN;

/// Delay between RX FIFO polls inside a bounded wait.
pub const RX_POLL_INTERVAL_MS: u64 = 1;
/// Bounded retry for gateway-issued radio commands.
pub const RF_CMD_RETRY: u8 = 3;
pub const RF_CMD_WAIT_MS: u64 = 100;
/// How long the gateway waits for each node's `PONG`.
pub const LIVENESS_TIMEOUT_MS: u64 = 200;
/// Radio warm-up before the gateway starts the liveness exchange.
pub const RADIO_SETTLE_MS: u64 = 2000;
/// Receive window per poll while a leaf waits for the gateway.
pub const LEAF_LISTEN_WINDOW_MS: u64 = 100;

pub type Payload = ArrayString<PAYLOAD_CAPACITY>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("payload of {0} bytes exceeds {max}", max = PAYLOAD_CAPACITY)]
    PayloadTooLong(usize),
    #[error("payload is not NUL-terminated")]
    Unterminated,
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

/// One radio message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfMessage {
    pub from_id: u8,
    pub to_id: u8,
    pub payload: Payload,
    pub timestamp_ms: u64,
}

impl RfMessage {
    pub fn new(from_id: u8, to_id: u8, text: &str, timestamp_ms: u64) -> Result<Self, LinkError> {
        let payload = Payload::from(text).map_err(|_| LinkError::PayloadTooLong(text.len()))?;
        Ok(Self {
            from_id,
            to_id,
            payload,
            timestamp_ms,
        })
    }

    pub fn text(&self) -> &str {
        &self.payload
    }

    pub fn encode(&self) -> Frame {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = self.from_id;
        frame[1] = self.to_id;
        let text = self.payload.as_bytes();
        frame[PAYLOAD_OFFSET..PAYLOAD_OFFSET + text.len()].copy_from_slice(text);
        frame[TIMESTAMP_OFFSET..].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        frame
    }

    pub fn decode(frame: &Frame) -> Result<Self, LinkError> {
        let field = &frame[PAYLOAD_OFFSET..TIMESTAMP_OFFSET];
        let len = field
            .iter()
            .position(|&b| b == 0)
            .ok_or(LinkError::Unterminated)?;
        let text = core::str::from_utf8(&field[..len]).map_err(|_| LinkError::InvalidUtf8)?;
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&frame[TIMESTAMP_OFFSET..]);
        Self::new(frame[0], frame[1], text, u64::from_le_bytes(stamp))
    }
}

/// Half-duplex messaging over one transceiver.
pub struct ReliableLink<R: Radio, C: MonotonicClock> {
    radio: R,
    clock: C,
    node_id: u8,
    radio_config: RadioConfig,
}

impl<R: Radio, C: MonotonicClock> ReliableLink<R, C> {
    pub fn new(radio: R, clock: C, node_id: u8, radio_config: RadioConfig) -> Self {
        Self {
            radio,
            clock,
            node_id,
            radio_config,
        }
    }

    /// Bring up the radio listening on this node's own address.
    pub fn init(&mut self) -> bool {
        let rx_address = self.radio_config.address_of(self.node_id);
        if !self.radio.init(self.radio_config.channel, rx_address) {
            warn!(node_id = self.node_id, "radio initialization failed");
            return false;
        }
        self.radio.start_listening();
        info!(node_id = self.node_id, address = %format!("{rx_address:#X}"), "radio listening");
        true
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Message from this node stamped with local uptime.
    pub fn message(&self, to_id: u8, text: &str) -> Result<RfMessage, LinkError> {
        RfMessage::new(self.node_id, to_id, text, self.clock.millis())
    }

    /// Raw transmit on the pipe of `to_id`. The caller owns listening state.
    pub fn send(&mut self, to_id: u8, msg: &RfMessage, want_ack: bool) -> bool {
        self.radio.open_writing_pipe(self.radio_config.address_of(to_id));
        self.radio.write(&msg.encode(), want_ack)
    }

    /// Stop listening, send, resume listening.
    pub fn transmit(&mut self, to_id: u8, msg: &RfMessage) -> bool {
        self.radio.stop_listening();
        let sent = self.send(to_id, msg, false);
        self.radio.start_listening();
        sent
    }

    /// First decodable frame within `timeout_ms`, whoever it is addressed to.
    pub fn receive(&mut self, timeout_ms: u64) -> Option<RfMessage> {
        let start = self.clock.millis();
        while self.clock.millis().saturating_sub(start) < timeout_ms {
            match self.radio.read() {
                Ok(frame) => match RfMessage::decode(&frame) {
                    Ok(msg) => return Some(msg),
                    Err(e) => debug!(error = %e, "dropping undecodable frame"),
                },
                Err(nb::Error::WouldBlock) => self.clock.delay_ms(RX_POLL_INTERVAL_MS),
                Err(nb::Error::Other(e)) => {
                    warn!(error = ?e, "radio read failed");
                    self.clock.delay_ms(RX_POLL_INTERVAL_MS);
                }
            }
        }
        None
    }

    /// Keep receiving until `accept` matches a frame or the deadline passes.
    pub fn receive_matching<F>(&mut self, timeout_ms: u64, mut accept: F) -> Option<RfMessage>
    where
        F: FnMut(&RfMessage) -> bool,
    {
        let deadline = self.clock.millis() + timeout_ms;
        loop {
            let remaining = deadline.saturating_sub(self.clock.millis());
            if remaining == 0 {
                return None;
            }
            match self.receive(remaining) {
                Some(msg) if accept(&msg) => return Some(msg),
                Some(msg) => debug!(from = msg.from_id, to = msg.to_id, text = msg.text(), "ignoring frame"),
                None => return None,
            }
        }
    }

    /// Send and wait for a reply addressed to this node, retrying the whole
    /// cycle up to `retries` times.
    pub fn request(&mut self, msg: &RfMessage, to_id: u8, timeout_ms: u64, retries: u8) -> Option<RfMessage> {
        let own_id = self.node_id;
        for attempt in 1..=retries {
            if !self.transmit(to_id, msg) {
                warn!(attempt, to_id, "send failed");
                continue;
            }
            if let Some(reply) = self.receive_matching(timeout_ms, |m| m.to_id == own_id) {
                return Some(reply);
            }
            warn!(attempt, to_id, "no response received");
        }
        None
    }

    pub fn send_then_receive(&mut self, msg: &RfMessage, to_id: u8, timeout_ms: u64, retries: u8) -> bool {
        self.request(msg, to_id, timeout_ms, retries).is_some()
    }

    /// Send `text` once to every peer. Returns how many sends the radio accepted.
    pub fn broadcast_command(&mut self, peers: &[u8], text: &str) -> Result<usize, LinkError> {
        let mut delivered = 0;
        for &to_id in peers {
            let msg = self.message(to_id, text)?;
            if self.transmit(to_id, &msg) {
                delivered += 1;
            } else {
                warn!(to_id, command = text, "failed to send command");
            }
        }
        info!(command = text, delivered, peers = peers.len(), "radio command sent");
        Ok(delivered)
    }

    /// [`Self::broadcast_command`] repeated `RF_CMD_RETRY` times, `RF_CMD_WAIT_MS` apart.
    pub fn send_command_with_retry(&mut self, peers: &[u8], text: &str) -> Result<(), LinkError> {
        for _ in 0..RF_CMD_RETRY {
            self.broadcast_command(peers, text)?;
            self.clock.delay_ms(RF_CMD_WAIT_MS);
        }
        Ok(())
    }

    /// Gateway side of the liveness exchange: hand each peer the current log
    /// number and record who answered with `PONG`.
    pub fn check_node_status(&mut self, peers: &[u8], log_number: i16, table: &mut NodeStatusTable) {
        self.clock.delay_ms(RADIO_SETTLE_MS);
        info!(log_number, "checking node status");

        for &node_id in peers {
            let text = format!("LOG {log_number}");
            let online = match self.message(node_id, &text) {
                Ok(msg) => {
                    self.transmit(node_id, &msg);
                    let own_id = self.node_id;
                    self.receive_matching(LIVENESS_TIMEOUT_MS, |m| {
                        m.to_id == own_id && m.from_id == node_id && m.text().starts_with("PONG")
                    })
                    .is_some()
                }
                Err(e) => {
                    warn!(node_id, error = %e, "cannot frame log message");
                    false
                }
            };
            if online {
                info!(node_id, "node online");
            } else {
                warn!(node_id, "node offline or unresponsive");
            }
            // The table is sized for every configured peer.
            let _ = table.insert(node_id, online);
        }
    }

    /// Leaf side: persist a `LOG <n>` addressed to us and answer `PONG <n>`.
    /// Returns the stored number, or `None` when `msg` is not a log request.
    pub fn answer_log_request(&mut self, msg: &RfMessage, storage: &mut dyn Storage) -> Option<i16> {
        if msg.to_id != self.node_id {
            return None;
        }
        let log_number = parse_log_request(msg.text())?;
        storage.persist_log_number(log_number);
        info!(log_number, "log number received and saved");

        match self.message(msg.from_id, &format!("PONG {log_number}")) {
            Ok(reply) => {
                self.transmit(msg.from_id, &reply);
            }
            Err(e) => warn!(error = %e, "cannot frame PONG"),
        }
        Some(log_number)
    }

    /// Block until the gateway's log request arrives, answer it once.
    pub fn await_log_request(&mut self, storage: &mut dyn Storage) -> i16 {
        info!(node_id = self.node_id, "waiting for log number from gateway");
        loop {
            if let Some(msg) = self.receive(LEAF_LISTEN_WINDOW_MS) {
                if let Some(log_number) = self.answer_log_request(&msg, storage) {
                    return log_number;
                }
            }
        }
    }
}

/// `LOG <n>` -> `n`.
pub fn parse_log_request(text: &str) -> Option<i16> {
    text.strip_prefix("LOG ")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let msg = RfMessage::new(100, 3, "CMD_RF_SYNC", 0x0102_0304_0506_0708).unwrap();
        let frame = msg.encode();
        assert_eq!(frame[0], 100);
        assert_eq!(frame[1], 3);
        assert_eq!(&frame[2..13], b"CMD_RF_SYNC");
        assert_eq!(frame[13], 0);
        assert_eq!(&frame[24..], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(RfMessage::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_payload_capacity() {
        assert!(RfMessage::new(1, 2, &"x".repeat(PAYLOAD_CAPACITY), 0).is_ok());
        assert_eq!(
            RfMessage::new(1, 2, &"x".repeat(PAYLOAD_FIELD_LEN), 0),
            Err(LinkError::PayloadTooLong(PAYLOAD_FIELD_LEN))
        );
    }

    #[test]
    fn test_unterminated_payload_rejected() {
        let mut frame = [b'A'; FRAME_LEN];
        frame[0] = 1;
        frame[1] = 2;
        assert_eq!(RfMessage::decode(&frame), Err(LinkError::Unterminated));
    }

    #[test]
    fn test_parse_log_request() {
        assert_eq!(parse_log_request("LOG 12"), Some(12));
        assert_eq!(parse_log_request("LOG -3"), Some(-3));
        assert_eq!(parse_log_request("LOG x"), None);
        assert_eq!(parse_log_request("PONG 1"), None);
    }
}
