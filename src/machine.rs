//! Per-node state machine.
//!
//! One cooperative control path: [`NodeStateMachine::tick`] looks at the
//! current [`NodeState`], runs whatever that state owns (possibly blocking
//! for a bounded or, for connects and leaf sync, unbounded time) and picks
//! the next state. Gateway and leaf share the machine and differ only in
//! their IDLE work and in which side of each protocol they run.

use crate::command::{apply_broker_command, apply_radio_command, BrokerCommand, CommandError, RadioCommand};
use crate::config::{BrokerConfig, ConfigError, NodeConfig, MAX_NODES};
use crate::hal::{MonotonicClock, Peripherals, Radio, Uplink};
use crate::link::ReliableLink;
use crate::node::{NodeContext, NodeFlags, NodeSnapshot, NodeState};
use crate::sensing::{retrieve_file, SensingError, SensingSession};
use crate::timesync::{broadcast_sync, collect_sync, sync_reference_time_blocking};
use heapless::Vec;
use tracing::{debug, error, info, warn};

/// Settle time before a reboot and at the start of boot.
pub const BOOT_SETTLE_MS: u64 = 3000;
/// How long the error indication is held before rebooting.
pub const ERROR_HOLD_MS: u64 = 3000;
/// Error pulse shown after a rejected operator command.
pub const ERROR_PULSE_MS: u64 = 3000;
/// Lead time before the scheduled start at which sensing is prepared.
pub const SENSING_PREPARING_DUR_MS: u64 = 5000;
pub const BROKER_SERVICE_INTERVAL_MS: u64 = 500;
pub const STORAGE_RETRY_MS: u64 = 1000;
pub const CONNECT_BACKOFF_MS: u64 = 2000;
/// Leaf receive window per IDLE tick.
pub const LEAF_IDLE_RX_MS: u64 = 200;
/// Pause after telling leaves to resync so they reach RF_COMMUNICATING first.
pub const RF_SYNC_LEAD_MS: u64 = 2000;
/// Time given to rebooted leaves before the liveness exchange is repeated.
pub const LEAF_REBOOT_WAIT_MS: u64 = 5000;
/// Poll period while waiting inside IDLE, PREPARING or SAMPLING.
pub const IDLE_POLL_MS: u64 = 1;

const SENSING_COMPLETED: &str = "Sensing completed!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// The node must be reset and booted again.
    Reboot,
}

pub struct NodeStateMachine<R: Radio, C: MonotonicClock> {
    ctx: NodeContext,
    link: ReliableLink<R, C>,
    peripherals: Peripherals,
    session: SensingSession,
    peers: Vec<u8, MAX_NODES>,
    last_broker_service_ms: Option<u64>,
}

fn connect_network<C: MonotonicClock>(uplink: &mut Uplink, clock: &C, flags: &mut NodeFlags) {
    let mut attempt = 0u32;
    while !uplink.network.is_connected() {
        attempt += 1;
        if uplink.network.connect() {
            break;
        }
        warn!(attempt, "network connect failed, retrying");
        clock.delay_ms(CONNECT_BACKOFF_MS);
    }
    if !flags.wifi_connected {
        info!("network connected");
    }
    flags.wifi_connected = true;
}

fn connect_broker<C: MonotonicClock>(uplink: &mut Uplink, broker: &BrokerConfig, clock: &C, flags: &mut NodeFlags) {
    let mut attempt = 0u32;
    while !uplink.broker.is_connected() {
        attempt += 1;
        if uplink.broker.connect(&broker.client_id, &broker.topic_sub) {
            info!(client_id = %broker.client_id, topic = %broker.topic_sub, "broker connected");
            break;
        }
        warn!(attempt, "broker connect failed, retrying");
        clock.delay_ms(CONNECT_BACKOFF_MS);
    }
    flags.mqtt_connected = true;
}

impl<R: Radio, C: MonotonicClock> NodeStateMachine<R, C> {
    pub fn new(config: NodeConfig, radio: R, clock: C, peripherals: Peripherals) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.is_gateway() && peripherals.uplink.is_none() {
            return Err(ConfigError::MissingUplink);
        }
        let link = ReliableLink::new(radio, clock, config.node_id, config.radio);
        let peers = config.peer_ids().collect();
        Ok(Self {
            ctx: NodeContext::new(config),
            link,
            peripherals,
            session: SensingSession::new(),
            peers,
            last_broker_service_ms: None,
        })
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut NodeContext {
        &mut self.ctx
    }

    pub fn state(&self) -> NodeState {
        self.ctx.state
    }

    pub fn link(&self) -> &ReliableLink<R, C> {
        &self.link
    }

    pub fn session(&self) -> &SensingSession {
        &self.session
    }

    pub fn is_gateway(&self) -> bool {
        self.ctx.config.is_gateway()
    }

    pub fn set_state(&mut self, state: NodeState) {
        if self.ctx.state != state {
            info!(node_id = self.ctx.config.node_id, from = %self.ctx.state, to = %state, "state change");
        }
        self.ctx.state = state;
        self.peripherals.indicator.set_state(state);
    }

    /// Current unified time.
    pub fn now(&mut self) -> u64 {
        self.ctx.clock.get_unified_time(self.link.clock().millis())
    }

    pub fn snapshot(&mut self) -> NodeSnapshot {
        let unified_time = self.now();
        NodeSnapshot {
            node_id: self.ctx.config.node_id,
            state: self.ctx.state,
            unified_time,
            drift_ratio: self.ctx.clock.drift_ratio,
            time_offset: self.ctx.clock.time_offset,
            flags: self.ctx.flags.clone(),
            schedule: self.ctx.schedule,
            online_peers: self.ctx.online_count(),
        }
    }

    /// Forget everything learned since boot, as a device reset would.
    /// Collaborators and their persisted data survive.
    pub fn reset(&mut self) {
        info!(node_id = self.ctx.config.node_id, "node reset");
        self.ctx = NodeContext::new(self.ctx.config.clone());
        self.session = SensingSession::new();
        self.last_broker_service_ms = None;
    }

    /// Bring the node from power-on to IDLE. Returns false when the node
    /// ended up in ERROR instead.
    pub fn boot(&mut self) -> bool {
        self.set_state(NodeState::Boot);
        self.link.clock().delay_ms(BOOT_SETTLE_MS);
        let node_id = self.ctx.config.node_id;
        info!(node_id, role = ?self.ctx.config.role, "booting");

        self.ctx.flags.serial_ready = true;
        self.ctx.flags.led_ready = self.peripherals.indicator.init();
        self.peripherals.indicator.set_state(NodeState::Boot);

        self.ctx.flags.imu_ready = self.peripherals.imu.init();
        if !self.ctx.flags.imu_ready {
            warn!(node_id, "accelerometer not detected");
        }

        while !self.peripherals.storage.init() {
            warn!(node_id, "storage not ready, retrying");
            self.link.clock().delay_ms(STORAGE_RETRY_MS);
        }
        self.ctx.flags.sd_ready = true;

        if !self.link.init() {
            error!(node_id, "radio failed to start");
            self.set_state(NodeState::Error);
            return false;
        }
        self.ctx.flags.rf_ready = true;

        if self.is_gateway() {
            self.set_state(NodeState::WifiCommunicating);
            if let Some(uplink) = self.peripherals.uplink.as_mut() {
                let clock = self.link.clock();
                connect_network(uplink, clock, &mut self.ctx.flags);
                sync_reference_time_blocking(uplink.time_source.as_mut(), clock, &mut self.ctx.clock);
                self.ctx.flags.time_ntp_synced = true;
                connect_broker(uplink, &self.ctx.config.broker, clock, &mut self.ctx.flags);
            }
        }

        self.set_state(NodeState::RfCommunicating);
        if self.is_gateway() {
            let log_number = self.peripherals.storage.load_log_number();
            self.link.check_node_status(&self.peers, log_number, &mut self.ctx.node_online);
            info!(online = self.ctx.online_count(), peers = self.peers.len(), "liveness check complete");
        } else {
            self.link.await_log_request(self.peripherals.storage.as_mut());
        }
        self.run_rf_sync();

        self.set_state(NodeState::Idle);
        info!(node_id, unified = %crate::clock::to_calendar(self.now()), "boot complete");
        true
    }

    /// Run one step of the current state.
    pub fn tick(&mut self) -> TickOutcome {
        match self.ctx.state {
            NodeState::Boot => {
                info!(node_id = self.ctx.config.node_id, "rebooting");
                self.link.clock().delay_ms(BOOT_SETTLE_MS);
                return TickOutcome::Reboot;
            }
            NodeState::Idle => {
                if self.is_gateway() {
                    self.gateway_idle();
                } else {
                    self.leaf_idle();
                }
                if self.ctx.state == NodeState::Idle {
                    self.check_sensing_start();
                }
            }
            NodeState::WifiCommunicating => self.wifi_communicate(),
            NodeState::RfCommunicating => {
                if self.ctx.flags.time_rf_required {
                    self.run_rf_sync();
                }
                self.set_state(NodeState::Idle);
            }
            NodeState::Preparing => self.prepare_sensing(),
            NodeState::Sampling => self.sample(),
            NodeState::Error => {
                error!(node_id = self.ctx.config.node_id, "node in error state");
                self.peripherals.indicator.show_error();
                self.link.clock().delay_ms(ERROR_HOLD_MS);
                return TickOutcome::Reboot;
            }
        }
        TickOutcome::Continue
    }

    /// Boot, then tick while `keep_running` allows, rebooting whenever a
    /// tick asks for it.
    pub fn run<F>(&mut self, mut keep_running: F)
    where
        F: FnMut(&mut Self) -> bool,
    {
        self.boot();
        while keep_running(self) {
            if self.tick() == TickOutcome::Reboot {
                self.reset();
                self.boot();
            }
        }
    }

    fn run_rf_sync(&mut self) {
        if self.is_gateway() {
            broadcast_sync(&mut self.link, &self.peers, &mut self.ctx.clock);
        } else {
            collect_sync(&mut self.link, &mut self.ctx.clock);
        }
        self.ctx.flags.time_rf_required = false;
        self.ctx.flags.time_rf_synced = true;
    }

    fn check_sensing_start(&mut self) {
        if !self.ctx.flags.sensing_scheduled {
            return;
        }
        let now = self.now();
        let prepare_at = self.ctx.schedule.scheduled_start_ms.saturating_sub(SENSING_PREPARING_DUR_MS);
        if now >= prepare_at {
            info!(now, start = self.ctx.schedule.scheduled_start_ms, "sensing start approaching");
            self.set_state(NodeState::Preparing);
        }
    }

    fn prepare_sensing(&mut self) {
        if !self.session.is_prepared() {
            let prepared = if self.ctx.flags.sd_ready && self.ctx.flags.imu_ready {
                self.session
                    .prepare(
                        self.ctx.config.node_id,
                        &self.ctx.schedule,
                        self.ctx.config.calibration,
                        self.peripherals.storage.as_mut(),
                    )
                    .map(|_| ())
            } else {
                Err(SensingError::NotReady)
            };
            if let Err(e) = prepared {
                error!(error = %e, "sensing preparation failed");
                self.set_state(NodeState::Error);
                return;
            }
        }

        if self.now() >= self.ctx.schedule.scheduled_start_ms {
            self.ctx.flags.sensing_active = true;
            self.set_state(NodeState::Sampling);
        } else {
            self.link.clock().delay_ms(IDLE_POLL_MS);
        }
    }

    fn sample(&mut self) {
        let now = self.now();
        if now >= self.ctx.schedule.scheduled_end_ms {
            self.session.stop(self.peripherals.storage.as_mut());
            self.ctx.flags.clear_sensing();
            if self.is_gateway() {
                self.publish(SENSING_COMPLETED);
            }
            self.set_state(NodeState::Idle);
            return;
        }

        match self
            .session
            .sample_once(now, self.peripherals.imu.as_mut(), self.peripherals.storage.as_mut())
        {
            Ok(true) => {}
            Ok(false) => self.link.clock().delay_ms(IDLE_POLL_MS),
            Err(e) => {
                error!(error = %e, "sampling failed");
                self.set_state(NodeState::Error);
            }
        }
    }

    fn wifi_communicate(&mut self) {
        if let Some(uplink) = self.peripherals.uplink.as_mut() {
            let clock = self.link.clock();
            connect_network(uplink, clock, &mut self.ctx.flags);

            if self.ctx.flags.gateway_ntp_required {
                sync_reference_time_blocking(uplink.time_source.as_mut(), clock, &mut self.ctx.clock);
                self.ctx.flags.gateway_ntp_required = false;
                self.ctx.flags.time_ntp_synced = true;
            }
            // Leaves have no reference service; they follow the gateway over radio.
            if self.ctx.flags.leafnode_ntp_required {
                self.ctx.flags.leafnode_ntp_required = false;
                self.ctx.flags.time_rf_required = true;
            }

            if self.ctx.flags.data_retrieval_requested {
                connect_broker(uplink, &self.ctx.config.broker, clock, &mut self.ctx.flags);
                let file = self.ctx.retrieval_file.take().unwrap_or_default();
                let topic = &self.ctx.config.broker.topic_pub;
                match retrieve_file(&file, self.peripherals.storage.as_mut(), uplink.broker.as_mut(), topic, clock) {
                    Ok(report) => debug!(file = %file, chunks = report.chunks, failed = report.failed_chunks, "retrieval finished"),
                    Err(e) => {
                        warn!(file = %file, error = %e, "retrieval failed");
                        uplink.broker.publish(topic, &format!("Retrieval failed: {file} not found"));
                    }
                }
                self.ctx.flags.data_retrieval_requested = false;
                self.ctx.flags.data_retrieval_sent = true;
            }
        }
        self.set_state(NodeState::Idle);
    }

    fn publish(&mut self, text: &str) {
        let Some(uplink) = self.peripherals.uplink.as_mut() else {
            return;
        };
        if !uplink.broker.publish(&self.ctx.config.broker.topic_pub, text) {
            warn!(text, "publish failed");
        }
    }

    fn error_pulse(&mut self) {
        self.peripherals.indicator.show_error();
        self.link.clock().delay_ms(ERROR_PULSE_MS);
        self.peripherals.indicator.set_state(self.ctx.state);
    }

    fn send_radio_command(&mut self, command: RadioCommand) {
        let text = command.encode();
        if let Err(e) = self.link.send_command_with_retry(&self.peers, &text) {
            warn!(command = %text, error = %e, "radio command not sent");
        }
    }

    fn gateway_idle(&mut self) {
        if self.ctx.flags.reboot_required_leafnode {
            self.ctx.flags.reboot_required_leafnode = false;
            self.send_radio_command(RadioCommand::Reboot);
            if !self.ctx.flags.reboot_required_gateway {
                // Rebooted leaves come back waiting for a log number and a resync.
                self.link.clock().delay_ms(LEAF_REBOOT_WAIT_MS);
                let log_number = self.peripherals.storage.load_log_number();
                self.link.check_node_status(&self.peers, log_number, &mut self.ctx.node_online);
                self.ctx.flags.time_rf_required = true;
            }
        }
        if self.ctx.flags.reboot_required_gateway {
            self.ctx.flags.reboot_required_gateway = false;
            self.set_state(NodeState::Boot);
            return;
        }

        self.service_broker();
        if self.ctx.state != NodeState::Idle {
            return;
        }

        if self.ctx.flags.sensing_requested {
            self.ctx.flags.sensing_requested = false;
            self.ctx.flags.sensing_scheduled = true;
            self.send_radio_command(RadioCommand::schedule(&self.ctx.schedule));
        }

        if self.ctx.flags.time_rf_required {
            self.send_radio_command(RadioCommand::RfSync);
            self.link.clock().delay_ms(RF_SYNC_LEAD_MS);
            self.set_state(NodeState::RfCommunicating);
            return;
        }

        self.link.clock().delay_ms(IDLE_POLL_MS);
    }

    fn service_broker(&mut self) {
        let local_now = self.link.clock().millis();
        if let Some(last) = self.last_broker_service_ms {
            if local_now.saturating_sub(last) < BROKER_SERVICE_INTERVAL_MS {
                return;
            }
        }
        self.last_broker_service_ms = Some(local_now);

        let Some(uplink) = self.peripherals.uplink.as_mut() else {
            return;
        };
        let clock = self.link.clock();
        if !uplink.network.is_connected() {
            self.ctx.flags.wifi_connected = false;
            warn!("network link lost, reconnecting");
        }
        connect_network(uplink, clock, &mut self.ctx.flags);
        if !uplink.broker.is_connected() {
            self.ctx.flags.mqtt_connected = false;
            warn!("broker session lost, reconnecting");
        }
        connect_broker(uplink, &self.ctx.config.broker, clock, &mut self.ctx.flags);

        // Messages behind a state-changing command wait for the next service.
        while let Some(text) = self.peripherals.uplink.as_mut().and_then(|u| u.broker.poll()) {
            self.handle_broker_message(&text);
            if self.ctx.state != NodeState::Idle {
                break;
            }
        }
    }

    /// Parse and apply one operator message, publishing the reply.
    pub fn handle_broker_message(&mut self, text: &str) {
        let text = text.trim_end_matches(['\r', '\n']);
        info!(message = text, "broker message received");
        let now = self.now();
        let result = text
            .parse::<BrokerCommand>()
            .and_then(|command| apply_broker_command(&mut self.ctx, &command, now));

        match result {
            Ok(outcome) => {
                if let Some(reply) = outcome.reply.as_deref() {
                    self.publish(reply);
                }
                if let Some(state) = outcome.next_state {
                    self.set_state(state);
                }
            }
            Err(e) => self.reject(&e),
        }
    }

    fn reject(&mut self, err: &CommandError) {
        warn!(error = %err, constraint = err.is_constraint_violation(), "command rejected");
        self.publish(&err.to_string());
        self.error_pulse();
    }

    fn leaf_idle(&mut self) {
        let Some(msg) = self.link.receive(LEAF_IDLE_RX_MS) else {
            return;
        };
        if msg.to_id != self.ctx.config.node_id {
            return;
        }
        debug!(from = msg.from_id, text = msg.text(), "radio message received");

        match msg.text().parse::<RadioCommand>() {
            Ok(RadioCommand::LogNumber(_)) => {
                self.link.answer_log_request(&msg, self.peripherals.storage.as_mut());
            }
            Ok(command) => {
                if let Some(state) = apply_radio_command(&mut self.ctx, &command) {
                    self.set_state(state);
                }
            }
            Err(e) => debug!(error = %e, "ignoring radio message"),
        }
    }
}
