//! In-process collaborators for tests and the simulator.
//!
//! Everything here is cheap to clone: clones share state, so a test keeps one
//! handle for inspection while the node owns another.

use crate::hal::{
    Accelerometer, Broker, Frame, Indicator, MonotonicClock, NetworkLink, Peripherals, Radio, RadioError,
    Storage, StorageError, TimeSource, Uplink,
};
use crate::link::RfMessage;
use crate::node::NodeState;
use heapless::Deque;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// nRF24 RX FIFO depth.
pub const RX_FIFO_DEPTH: usize = 3;
/// Delay before a responder's reply lands in the requester's FIFO.
pub const RESPONDER_LATENCY_MS: u64 = 2;

/// Shared manual clock. `delay_ms` advances time instead of sleeping, so
/// multi-second protocol waits run instantly.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl MonotonicClock for ManualClock {
    fn millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn delay_ms(&self, ms: u64) {
        self.advance(ms);
    }
}

/// Clock running fast or slow against another by `skew_ppm`, with a fixed
/// boot offset. Models a leaf's free-running oscillator.
#[derive(Debug, Clone, Copy)]
pub struct SkewedClock<C> {
    inner: C,
    skew_ppm: i32,
    boot_offset_ms: u64,
}

impl<C: MonotonicClock> SkewedClock<C> {
    pub fn new(inner: C, skew_ppm: i32, boot_offset_ms: u64) -> Self {
        Self {
            inner,
            skew_ppm,
            boot_offset_ms,
        }
    }
}

impl<C: MonotonicClock> MonotonicClock for SkewedClock<C> {
    fn millis(&self) -> u64 {
        let base = self.inner.millis() as f64;
        let scaled = base * (1.0 + f64::from(self.skew_ppm) / 1_000_000.0);
        self.boot_offset_ms + scaled as u64
    }

    fn delay_ms(&self, ms: u64) {
        self.inner.delay_ms(ms);
    }
}

type Responder = Box<dyn FnMut(&RfMessage) -> Option<RfMessage> + Send>;

#[derive(Debug, Default)]
struct RadioSlot {
    listening: bool,
    rx: Deque<Frame, RX_FIFO_DEPTH>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    deliver_at: u64,
    address: u64,
    frame: Frame,
}

/// One frame put on the air.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transmission {
    pub at_ms: u64,
    pub from_address: u64,
    pub to_address: u64,
    pub frame: Frame,
}

impl Transmission {
    pub fn message(&self) -> Option<RfMessage> {
        RfMessage::decode(&self.frame).ok()
    }
}

#[derive(Default)]
struct MediumState {
    slots: HashMap<u64, RadioSlot>,
    responders: HashMap<u64, Responder>,
    in_flight: Vec<InFlight>,
    /// `None` when the air log is off; per-address counts are always kept.
    transmissions: Option<Vec<Transmission>>,
    tx_counts: HashMap<u64, usize>,
    dropped: usize,
}

impl MediumState {
    fn deliver(&mut self, address: u64, frame: Frame) -> bool {
        match self.slots.get_mut(&address) {
            Some(slot) if slot.listening => {
                if slot.rx.push_back(frame).is_ok() {
                    true
                } else {
                    self.dropped += 1;
                    false
                }
            }
            _ => {
                self.dropped += 1;
                false
            }
        }
    }

    fn pump(&mut self, now: u64) {
        let (due, pending): (Vec<_>, Vec<_>) = self.in_flight.drain(..).partition(|f| f.deliver_at <= now);
        self.in_flight = pending;
        for flight in due {
            self.deliver(flight.address, flight.frame);
        }
    }
}

/// The shared air between simulated radios.
///
/// Frames go straight into the addressed radio's FIFO when it is listening
/// and has room; otherwise they are lost. Addresses with a responder never
/// receive frames; the responder answers on their behalf after
/// [`RESPONDER_LATENCY_MS`].
#[derive(Clone)]
pub struct SimMedium {
    state: Arc<Mutex<MediumState>>,
}

impl Default for SimMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMedium {
    /// Medium that keeps every frame put on the air for inspection.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MediumState {
                transmissions: Some(Vec::new()),
                ..MediumState::default()
            })),
        }
    }

    /// Medium for long runs: only per-radio transmit counts are kept.
    pub fn unrecorded() -> Self {
        Self {
            state: Arc::new(Mutex::new(MediumState::default())),
        }
    }

    /// Answer every frame sent to `address` with whatever `respond` returns.
    pub fn add_responder<F>(&self, address: u64, respond: F)
    where
        F: FnMut(&RfMessage) -> Option<RfMessage> + Send + 'static,
    {
        self.state.lock().responders.insert(address, Box::new(respond));
    }

    /// Queue `frame` for `address`, delivered once the receiver's clock
    /// reaches `deliver_at`.
    pub fn inject(&self, deliver_at: u64, address: u64, frame: Frame) {
        self.state.lock().in_flight.push(InFlight {
            deliver_at,
            address,
            frame,
        });
    }

    /// Logged frames, oldest first. Empty for an [`unrecorded`](Self::unrecorded) medium.
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state.lock().transmissions.clone().unwrap_or_default()
    }

    pub fn transmissions_from(&self, address: u64) -> usize {
        self.state.lock().tx_counts.get(&address).copied().unwrap_or(0)
    }

    pub fn dropped(&self) -> usize {
        self.state.lock().dropped
    }

    fn register(&self, address: u64) {
        self.state.lock().slots.entry(address).or_default();
    }

    fn set_listening(&self, address: u64, listening: bool) {
        if let Some(slot) = self.state.lock().slots.get_mut(&address) {
            slot.listening = listening;
        }
    }

    fn is_listening(&self, address: u64) -> bool {
        self.state.lock().slots.get(&address).map_or(false, |s| s.listening)
    }

    fn transmit(&self, now: u64, from_address: u64, to_address: u64, frame: Frame) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        *state.tx_counts.entry(from_address).or_default() += 1;
        if let Some(log) = state.transmissions.as_mut() {
            log.push(Transmission {
                at_ms: now,
                from_address,
                to_address,
                frame,
            });
        }

        if let Some(respond) = state.responders.get_mut(&to_address) {
            let reply = RfMessage::decode(&frame).ok().and_then(|msg| respond(&msg));
            if let Some(reply) = reply {
                state.in_flight.push(InFlight {
                    deliver_at: now + RESPONDER_LATENCY_MS,
                    address: from_address,
                    frame: reply.encode(),
                });
            }
            return true;
        }
        state.deliver(to_address, frame)
    }

    fn pop(&self, now: u64, address: u64) -> Option<Frame> {
        let mut state = self.state.lock();
        state.pump(now);
        state.slots.get_mut(&address).and_then(|slot| slot.rx.pop_front())
    }
}

/// Radio attached to a [`SimMedium`].
pub struct SimRadio<C> {
    medium: SimMedium,
    clock: C,
    address: u64,
    writing: Option<u64>,
    fail_init: bool,
}

impl<C: MonotonicClock> SimRadio<C> {
    pub fn new(medium: SimMedium, clock: C) -> Self {
        Self {
            medium,
            clock,
            address: 0,
            writing: None,
            fail_init: false,
        }
    }

    /// A transceiver that never comes up.
    pub fn broken(medium: SimMedium, clock: C) -> Self {
        Self {
            fail_init: true,
            ..Self::new(medium, clock)
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn is_listening(&self) -> bool {
        self.medium.is_listening(self.address)
    }

    pub fn tx_count(&self) -> usize {
        self.medium.transmissions_from(self.address)
    }
}

impl<C: MonotonicClock> Radio for SimRadio<C> {
    fn init(&mut self, _channel: u8, rx_address: u64) -> bool {
        if self.fail_init {
            return false;
        }
        self.address = rx_address;
        self.medium.register(rx_address);
        true
    }

    fn start_listening(&mut self) {
        self.medium.set_listening(self.address, true);
    }

    fn stop_listening(&mut self) {
        self.medium.set_listening(self.address, false);
    }

    fn open_writing_pipe(&mut self, address: u64) {
        self.writing = Some(address);
    }

    fn write(&mut self, frame: &Frame, want_ack: bool) -> bool {
        let Some(to_address) = self.writing else {
            return false;
        };
        let delivered = self.medium.transmit(self.clock.millis(), self.address, to_address, *frame);
        trace!(to = to_address, delivered, "sim frame sent");
        // Without auto-ack the transmitter cannot tell whether anyone heard it.
        delivered || !want_ack
    }

    fn read(&mut self) -> nb::Result<Frame, RadioError> {
        if self.fail_init {
            return Err(nb::Error::Other(RadioError::NotResponding));
        }
        self.medium
            .pop(self.clock.millis(), self.address)
            .ok_or(nb::Error::WouldBlock)
    }
}

#[derive(Debug, Default)]
struct StorageState {
    init_failures: u32,
    log_number: i16,
    files: BTreeMap<String, Vec<u8>>,
}

/// Storage card kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<StorageState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `count` init attempts.
    pub fn with_init_failures(count: u32) -> Self {
        let storage = Self::new();
        storage.state.lock().init_failures = count;
        storage
    }

    pub fn log_number(&self) -> i16 {
        self.state.lock().log_number
    }

    pub fn insert_file(&self, name: &str, contents: &[u8]) {
        self.state.lock().files.insert(name.to_string(), contents.to_vec());
    }

    pub fn file(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .files
            .get(name)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn file_names(&self) -> Vec<String> {
        self.state.lock().files.keys().cloned().collect()
    }
}

impl Storage for MemoryStorage {
    fn init(&mut self) -> bool {
        let mut state = self.state.lock();
        if state.init_failures > 0 {
            state.init_failures -= 1;
            return false;
        }
        true
    }

    fn load_log_number(&mut self) -> i16 {
        self.state.lock().log_number
    }

    fn persist_log_number(&mut self, log_number: i16) {
        self.state.lock().log_number = log_number;
    }

    fn create_file(&mut self, name: &str) -> Result<(), StorageError> {
        self.state.lock().files.insert(name.to_string(), Vec::new());
        Ok(())
    }

    fn append_line(&mut self, name: &str, line: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let file = state
            .files
            .get_mut(name)
            .ok_or_else(|| StorageError::WriteFailed(name.to_string()))?;
        file.extend_from_slice(line.as_bytes());
        file.push(b'\n');
        Ok(())
    }

    fn read_file(&mut self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.state
            .lock()
            .files
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }
}

/// Accelerometer returning a fixed reading.
#[derive(Debug, Clone, Copy)]
pub struct SimImu {
    sample: (i16, i16, i16),
    present: bool,
}

impl SimImu {
    pub fn new(sample: (i16, i16, i16)) -> Self {
        Self { sample, present: true }
    }

    /// Resting flat: 1 g on Z.
    pub fn at_rest() -> Self {
        Self::new((0, 0, 16384))
    }

    pub fn missing() -> Self {
        Self {
            present: false,
            ..Self::at_rest()
        }
    }
}

impl Accelerometer for SimImu {
    fn init(&mut self) -> bool {
        self.present
    }

    fn read_acceleration(&mut self) -> (i16, i16, i16) {
        self.sample
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorEvent {
    State(NodeState),
    ErrorPulse,
}

/// Indicator that records everything it was asked to show.
#[derive(Debug, Clone, Default)]
pub struct RecordingIndicator {
    events: Arc<Mutex<Vec<IndicatorEvent>>>,
}

impl RecordingIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<IndicatorEvent> {
        self.events.lock().clone()
    }

    pub fn last_state(&self) -> Option<NodeState> {
        self.events.lock().iter().rev().find_map(|e| match e {
            IndicatorEvent::State(s) => Some(*s),
            IndicatorEvent::ErrorPulse => None,
        })
    }

    pub fn error_pulses(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, IndicatorEvent::ErrorPulse))
            .count()
    }
}

impl Indicator for RecordingIndicator {
    fn init(&mut self) -> bool {
        true
    }

    fn set_state(&mut self, state: NodeState) {
        self.events.lock().push(IndicatorEvent::State(state));
    }

    fn show_error(&mut self) {
        self.events.lock().push(IndicatorEvent::ErrorPulse);
    }
}

#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    connect_failures: u32,
    attempts: u32,
}

/// Network link that connects after a configurable number of failures.
#[derive(Debug, Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<LinkState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_failures(count: u32) -> Self {
        let network = Self::new();
        network.state.lock().connect_failures = count;
        network
    }

    pub fn drop_link(&self) {
        self.state.lock().connected = false;
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }
}

impl NetworkLink for SimNetwork {
    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn connect(&mut self) -> bool {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return false;
        }
        state.connected = true;
        true
    }
}

#[derive(Debug, Default)]
struct BrokerBus {
    link: LinkState,
    client_id: Option<String>,
    subscribed: Option<String>,
    inbound: VecDeque<String>,
    published: VecDeque<String>,
}

/// Broker session over an in-memory bus. Operator traffic is injected with
/// [`SimBroker::inject`]; node replies are read back with
/// [`SimBroker::drain_published`].
#[derive(Debug, Clone, Default)]
pub struct SimBroker {
    bus: Arc<Mutex<BrokerBus>>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_failures(count: u32) -> Self {
        let broker = Self::new();
        broker.bus.lock().link.connect_failures = count;
        broker
    }

    pub fn inject(&self, text: &str) {
        self.bus.lock().inbound.push_back(text.to_string());
    }

    pub fn disconnect(&self) {
        self.bus.lock().link.connected = false;
    }

    pub fn client_id(&self) -> Option<String> {
        self.bus.lock().client_id.clone()
    }

    pub fn subscribed_topic(&self) -> Option<String> {
        self.bus.lock().subscribed.clone()
    }

    /// Texts published since the previous drain. Drained texts are released.
    pub fn drain_published(&self) -> Vec<String> {
        self.bus.lock().published.drain(..).collect()
    }

    /// Texts waiting to be drained.
    pub fn pending_published(&self) -> usize {
        self.bus.lock().published.len()
    }
}

impl Broker for SimBroker {
    fn is_connected(&self) -> bool {
        self.bus.lock().link.connected
    }

    fn connect(&mut self, client_id: &str, subscribe_topic: &str) -> bool {
        let mut bus = self.bus.lock();
        bus.link.attempts += 1;
        if bus.link.connect_failures > 0 {
            bus.link.connect_failures -= 1;
            return false;
        }
        bus.link.connected = true;
        bus.client_id = Some(client_id.to_string());
        bus.subscribed = Some(subscribe_topic.to_string());
        true
    }

    fn publish(&mut self, topic: &str, text: &str) -> bool {
        let mut bus = self.bus.lock();
        if !bus.link.connected {
            return false;
        }
        trace!(topic, text, "published");
        bus.published.push_back(text.to_string());
        true
    }

    fn poll(&mut self) -> Option<String> {
        let mut bus = self.bus.lock();
        if !bus.link.connected {
            return None;
        }
        bus.inbound.pop_front()
    }
}

/// Time service replaying a fixed list of answers, then `fallback` forever.
#[derive(Debug, Clone)]
pub struct ScriptedTimeSource {
    answers: Arc<Mutex<VecDeque<Option<u64>>>>,
    fallback: Option<u64>,
}

impl ScriptedTimeSource {
    pub fn new(answers: impl IntoIterator<Item = Option<u64>>, fallback: Option<u64>) -> Self {
        Self {
            answers: Arc::new(Mutex::new(answers.into_iter().collect())),
            fallback,
        }
    }

    /// Always answers `epoch_s`.
    pub fn fixed(epoch_s: u64) -> Self {
        Self::new([], Some(epoch_s))
    }
}

impl TimeSource for ScriptedTimeSource {
    fn fetch_epoch_seconds(&mut self) -> Option<u64> {
        self.answers.lock().pop_front().unwrap_or(self.fallback)
    }
}

/// Reference time from the host's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostTimeSource;

impl TimeSource for HostTimeSource {
    fn fetch_epoch_seconds(&mut self) -> Option<u64> {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs())
    }
}

/// Test-side handles to one simulated node's collaborators.
#[derive(Debug, Clone, Default)]
pub struct SimHandles {
    pub storage: MemoryStorage,
    pub indicator: RecordingIndicator,
    pub broker: SimBroker,
    pub network: SimNetwork,
}

impl SimHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf_peripherals(&self) -> Peripherals {
        Peripherals {
            imu: Box::new(SimImu::at_rest()),
            storage: Box::new(self.storage.clone()),
            indicator: Box::new(self.indicator.clone()),
            uplink: None,
        }
    }

    pub fn gateway_peripherals<T>(&self, time_source: T) -> Peripherals
    where
        T: TimeSource + Send + 'static,
    {
        Peripherals {
            uplink: Some(Uplink {
                network: Box::new(self.network.clone()),
                broker: Box::new(self.broker.clone()),
                time_source: Box::new(time_source),
            }),
            ..self.leaf_peripherals()
        }
    }
}
