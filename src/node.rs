//! Process-owned node context: state, flags, schedule and clock.

use crate::clock::ClockModel;
use crate::config::{NodeConfig, MAX_NODES};
use heapless::LinearMap;
use serde::{Deserialize, Serialize};

/// Mutually exclusive operational phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Boot,
    Idle,
    Preparing,
    Sampling,
    RfCommunicating,
    WifiCommunicating,
    Error,
}

impl core::fmt::Display for NodeState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            NodeState::Boot => "BOOT",
            NodeState::Idle => "IDLE",
            NodeState::Preparing => "PREPARING",
            NodeState::Sampling => "SAMPLING",
            NodeState::RfCommunicating => "RF_COMMUNICATING",
            NodeState::WifiCommunicating => "WIFI_COMMUNICATING",
            NodeState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Independent signals raised by the protocols and consumed by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    pub reboot_required_gateway: bool,
    pub reboot_required_leafnode: bool,

    pub serial_ready: bool,
    pub led_ready: bool,
    pub imu_ready: bool,
    pub rf_ready: bool,
    pub sd_ready: bool,

    pub wifi_connected: bool,
    pub mqtt_connected: bool,

    pub gateway_ntp_required: bool,
    pub leafnode_ntp_required: bool,
    pub time_ntp_synced: bool,
    pub time_rf_required: bool,
    pub time_rf_synced: bool,

    pub sensing_requested: bool,
    pub sensing_scheduled: bool,
    pub sensing_active: bool,

    pub data_retrieval_requested: bool,
    /// True until a retrieval is requested.
    pub data_retrieval_sent: bool,
}

impl Default for NodeFlags {
    fn default() -> Self {
        Self {
            reboot_required_gateway: false,
            reboot_required_leafnode: false,
            serial_ready: false,
            led_ready: false,
            imu_ready: false,
            rf_ready: false,
            sd_ready: false,
            wifi_connected: false,
            mqtt_connected: false,
            gateway_ntp_required: false,
            leafnode_ntp_required: false,
            time_ntp_synced: false,
            time_rf_required: false,
            time_rf_synced: false,
            sensing_requested: false,
            sensing_scheduled: false,
            sensing_active: false,
            data_retrieval_requested: false,
            data_retrieval_sent: true,
        }
    }
}

impl NodeFlags {
    pub fn clear_sensing(&mut self) {
        self.sensing_requested = false;
        self.sensing_scheduled = false;
        self.sensing_active = false;
    }
}

/// When and how fast to sample, in unified time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensingSchedule {
    pub scheduled_start_ms: u64,
    pub scheduled_end_ms: u64,
    pub rate_hz: u32,
    pub duration_s: u32,
}

impl SensingSchedule {
    pub fn starting_at(start_ms: u64, rate_hz: u32, duration_s: u32) -> Self {
        Self {
            scheduled_start_ms: start_ms,
            scheduled_end_ms: start_ms + u64::from(duration_s) * 1000,
            rate_hz,
            duration_s,
        }
    }
}

pub type NodeStatusTable = LinearMap<u8, bool, MAX_NODES>;

/// Everything the node knows about itself. Created once per boot and
/// mutated in place; every component takes it by reference.
#[derive(Debug)]
pub struct NodeContext {
    pub config: NodeConfig,
    pub state: NodeState,
    pub flags: NodeFlags,
    pub schedule: SensingSchedule,
    pub clock: ClockModel,
    /// Liveness of each peer as of the last log-number exchange.
    pub node_online: NodeStatusTable,
    /// File requested by the last retrieval command.
    pub retrieval_file: Option<String>,
}

impl NodeContext {
    pub fn new(config: NodeConfig) -> Self {
        let schedule = SensingSchedule {
            rate_hz: config.default_sensing_rate_hz,
            duration_s: config.default_sensing_duration_s,
            ..SensingSchedule::default()
        };
        Self {
            config,
            state: NodeState::Boot,
            flags: NodeFlags::default(),
            schedule,
            clock: ClockModel::new(),
            node_online: LinearMap::new(),
            retrieval_file: None,
        }
    }

    pub fn online_count(&self) -> usize {
        self.node_online.values().filter(|&&online| online).count()
    }
}

/// Serializable view of a node for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: u8,
    pub state: NodeState,
    pub unified_time: u64,
    pub drift_ratio: f64,
    pub time_offset: i64,
    pub flags: NodeFlags,
    pub schedule: SensingSchedule,
    pub online_peers: usize,
}
