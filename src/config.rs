//! Deployment configuration. Fixed per node at build/flash time; the
//! simulator assembles a whole network from a [`NetworkProfile`].

use serde::{Deserialize, Serialize};

/// Upper bound on nodes in one network, sizes the status table.
pub const MAX_NODES: usize = 16;

pub const DEFAULT_GATEWAY_ID: u8 = 100;
pub const DEFAULT_SENSING_RATE_HZ: u32 = 200;
pub const DEFAULT_SENSING_DURATION_S: u32 = 60;
pub const MAX_SENSING_RATE_HZ: u32 = 1000;

pub const RF_CHANNEL: u8 = 108;
/// 40-bit pipe base, OR'd with the 8-bit node id.
pub const RF_PIPE_BASE: u64 = 0xF0_F0F0_F000;

pub const MQTT_TOPIC_PUB: &str = "ArduinoNode/node";
pub const MQTT_TOPIC_SUB: &str = "ArduinoNode/server";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("node id 0 is reserved")]
    ZeroNodeId,
    #[error("node count {0} exceeds the supported maximum of {max}", max = MAX_NODES)]
    TooManyNodes(u8),
    #[error("leaf id {id} outside 1..={count}")]
    LeafIdOutOfRange { id: u8, count: u8 },
    #[error("gateway id {id} collides with leaf range 1..={count}")]
    GatewayIdInLeafRange { id: u8, count: u8 },
    #[error("default sensing rate {0} Hz outside 1..={max}", max = MAX_SENSING_RATE_HZ)]
    BadDefaultRate(u32),
    #[error("default sensing duration must be non-zero")]
    ZeroDefaultDuration,
    #[error("default schedule {rate_hz} Hz / {duration_s} s does not fit a radio frame")]
    DefaultScheduleTooLong { rate_hz: u32, duration_s: u32 },
    #[error("gateway requires network, broker and time-source collaborators")]
    MissingUplink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Gateway,
    Leaf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub client_id: String,
    pub topic_pub: String,
    pub topic_sub: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioConfig {
    pub channel: u8,
    pub pipe_base: u64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            channel: RF_CHANNEL,
            pipe_base: RF_PIPE_BASE,
        }
    }
}

impl RadioConfig {
    pub fn address_of(&self, node_id: u8) -> u64 {
        self.pipe_base | u64::from(node_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub node_id: u8,
    /// Leaf ids are `1..=node_count`.
    pub node_count: u8,
    pub default_sensing_rate_hz: u32,
    pub default_sensing_duration_s: u32,
    /// Per-axis accelerometer calibration scale.
    pub calibration: [f32; 3],
    pub broker: BrokerConfig,
    pub radio: RadioConfig,
}

impl NodeConfig {
    fn with_role(role: NodeRole, node_id: u8, node_count: u8) -> Self {
        let client_id = match role {
            NodeRole::Gateway => "GATEWAY".to_string(),
            NodeRole::Leaf => format!("LEAFNODE{node_id}"),
        };
        Self {
            role,
            node_id,
            node_count,
            default_sensing_rate_hz: DEFAULT_SENSING_RATE_HZ,
            default_sensing_duration_s: DEFAULT_SENSING_DURATION_S,
            calibration: [1.0; 3],
            broker: BrokerConfig {
                client_id,
                topic_pub: MQTT_TOPIC_PUB.to_string(),
                topic_sub: MQTT_TOPIC_SUB.to_string(),
            },
            radio: RadioConfig::default(),
        }
    }

    pub fn gateway(node_id: u8, node_count: u8) -> Self {
        Self::with_role(NodeRole::Gateway, node_id, node_count)
    }

    pub fn leaf(node_id: u8, node_count: u8) -> Self {
        Self::with_role(NodeRole::Leaf, node_id, node_count)
    }

    pub fn is_gateway(&self) -> bool {
        self.role == NodeRole::Gateway
    }

    /// Every peer id this node talks to, ascending, excluding itself.
    pub fn peer_ids(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=self.node_count).filter(move |&id| id != self.node_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 {
            return Err(ConfigError::ZeroNodeId);
        }
        if usize::from(self.node_count) > MAX_NODES {
            return Err(ConfigError::TooManyNodes(self.node_count));
        }
        let in_leaf_range = (1..=self.node_count).contains(&self.node_id);
        match self.role {
            NodeRole::Leaf if !in_leaf_range => {
                return Err(ConfigError::LeafIdOutOfRange {
                    id: self.node_id,
                    count: self.node_count,
                })
            }
            NodeRole::Gateway if in_leaf_range => {
                return Err(ConfigError::GatewayIdInLeafRange {
                    id: self.node_id,
                    count: self.node_count,
                })
            }
            _ => {}
        }
        if self.default_sensing_rate_hz == 0 || self.default_sensing_rate_hz > MAX_SENSING_RATE_HZ {
            return Err(ConfigError::BadDefaultRate(self.default_sensing_rate_hz));
        }
        if self.default_sensing_duration_s == 0 {
            return Err(ConfigError::ZeroDefaultDuration);
        }
        if !crate::command::schedule_fits_radio(self.default_sensing_rate_hz, self.default_sensing_duration_s) {
            return Err(ConfigError::DefaultScheduleTooLong {
                rate_hz: self.default_sensing_rate_hz,
                duration_s: self.default_sensing_duration_s,
            });
        }
        Ok(())
    }
}

/// Whole-network description consumed by the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkProfile {
    pub gateway_id: u8,
    pub leaf_count: u8,
    pub default_sensing_rate_hz: u32,
    pub default_sensing_duration_s: u32,
    pub calibration: [f32; 3],
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self {
            gateway_id: DEFAULT_GATEWAY_ID,
            leaf_count: 3,
            default_sensing_rate_hz: DEFAULT_SENSING_RATE_HZ,
            default_sensing_duration_s: DEFAULT_SENSING_DURATION_S,
            calibration: [1.0; 3],
        }
    }
}

impl NetworkProfile {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    fn apply(&self, mut config: NodeConfig) -> NodeConfig {
        config.default_sensing_rate_hz = self.default_sensing_rate_hz;
        config.default_sensing_duration_s = self.default_sensing_duration_s;
        config.calibration = self.calibration;
        config
    }

    pub fn gateway_config(&self) -> NodeConfig {
        self.apply(NodeConfig::gateway(self.gateway_id, self.leaf_count))
    }

    pub fn leaf_configs(&self) -> Vec<NodeConfig> {
        (1..=self.leaf_count)
            .filter(|&id| id != self.gateway_id)
            .map(|id| self.apply(NodeConfig::leaf(id, self.leaf_count)))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway_config().validate()?;
        self.leaf_configs().iter().try_for_each(NodeConfig::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_validate() {
        assert!(NodeConfig::gateway(100, 8).validate().is_ok());
        assert!(NodeConfig::leaf(3, 8).validate().is_ok());
    }

    #[test]
    fn test_invalid_ids_rejected() {
        assert_eq!(NodeConfig::leaf(0, 8).validate(), Err(ConfigError::ZeroNodeId));
        assert_eq!(
            NodeConfig::leaf(9, 8).validate(),
            Err(ConfigError::LeafIdOutOfRange { id: 9, count: 8 })
        );
        assert_eq!(
            NodeConfig::gateway(2, 8).validate(),
            Err(ConfigError::GatewayIdInLeafRange { id: 2, count: 8 })
        );
        assert_eq!(NodeConfig::leaf(1, 20).validate(), Err(ConfigError::TooManyNodes(20)));
    }

    #[test]
    fn test_bad_defaults_rejected() {
        let mut config = NodeConfig::leaf(1, 4);
        config.default_sensing_rate_hz = 0;
        assert_eq!(config.validate(), Err(ConfigError::BadDefaultRate(0)));
        config.default_sensing_rate_hz = 100;
        config.default_sensing_duration_s = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroDefaultDuration));
        config.default_sensing_duration_s = 300;
        assert_eq!(
            config.validate(),
            Err(ConfigError::DefaultScheduleTooLong {
                rate_hz: 100,
                duration_s: 300
            })
        );
    }

    #[test]
    fn test_address_derivation() {
        let radio = RadioConfig::default();
        assert_eq!(radio.address_of(3), 0xF0_F0F0_F003);
        assert_eq!(radio.address_of(100), 0xF0_F0F0_F064);
    }

    #[test]
    fn test_peer_ids_skip_self() {
        let leaf = NodeConfig::leaf(2, 4);
        assert_eq!(leaf.peer_ids().collect::<Vec<_>>(), vec![1, 3, 4]);
        let gateway = NodeConfig::gateway(100, 3);
        assert_eq!(gateway.peer_ids().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_profile_from_json() {
        let profile = NetworkProfile::from_json(r#"{"gateway_id":50,"leaf_count":2}"#).unwrap();
        assert_eq!(profile.gateway_id, 50);
        assert_eq!(profile.default_sensing_rate_hz, DEFAULT_SENSING_RATE_HZ);
        let leaves = profile.leaf_configs();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[1].broker.client_id, "LEAFNODE2");
        assert!(profile.validate().is_ok());
    }
}
