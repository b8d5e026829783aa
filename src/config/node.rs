//! Node identity and protocol tuning.
//!
//! A node refuses to start with an ID outside the band reserved for its role,
//! so a misconfigured repeater can never answer as a server.
//!
//! # Example
//!
//! ```
//! use dismissal_mesh::config::{NodeConfig, NodeRole};
//!
//! let config = NodeConfig::new(102, NodeRole::Scanner).unwrap();
//! assert!(config.validate().is_ok());
//!
//! assert!(NodeConfig::new(5, NodeRole::Repeater).is_err());
//! ```

use crate::delivery::RetryPolicy;
use crate::lora::CollisionConfig;
use crate::packet::{DEFAULT_TTL, HEADER_SIZE, MAX_PAYLOAD};
use serde::Deserialize;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable pointing at a JSON config file.
pub const ENV_CONFIG_PATH: &str = "MESH_CONFIG";

/// Environment variable holding the node ID.
pub const ENV_NODE_ID: &str = "MESH_NODE_ID";

/// Environment variable holding the role name.
pub const ENV_ROLE: &str = "MESH_ROLE";

/// Upper bound for the seen cache; more peers than this on one channel is not
/// a school campus.
const MAX_SEEN_PEERS_LIMIT: usize = 65_536;

/// What a node does in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Answers lookups; final recipient of scanner requests.
    Server,
    /// Kiosk or handheld that originates lookups.
    Scanner,
    /// Relays traffic not addressed to it.
    Repeater,
}

impl NodeRole {
    /// Node IDs reserved for this role.
    pub fn id_range(self) -> RangeInclusive<u16> {
        match self {
            Self::Server => 1..=99,
            Self::Scanner => 100..=199,
            Self::Repeater => 200..=299,
        }
    }

    /// Whether `node_id` falls in this role's band.
    pub fn accepts_id(self, node_id: u16) -> bool {
        self.id_range().contains(&node_id)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Scanner => write!(f, "scanner"),
            Self::Repeater => write!(f, "repeater"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "scanner" => Ok(Self::Scanner),
            "repeater" => Ok(Self::Repeater),
            other => Err(ConfigError::UnknownRole(other.to_string())),
        }
    }
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Node ID is outside the band reserved for the role.
    InvalidNodeId {
        /// Configured ID.
        node_id: u16,
        /// Configured role.
        role: NodeRole,
    },
    /// Role name not recognised.
    UnknownRole(String),
    /// Invalid configuration parameter.
    InvalidConfig(&'static str),
    /// Required environment variable is not set.
    MissingEnv(&'static str),
    /// Config file could not be read.
    Io(String),
    /// Config text could not be parsed.
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNodeId { node_id, role } => {
                let range = role.id_range();
                write!(
                    f,
                    "node id {} is outside the {} band {}-{}",
                    node_id,
                    role,
                    range.start(),
                    range.end()
                )
            }
            Self::UnknownRole(role) => write!(f, "unknown role '{}'", role),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Self::MissingEnv(var) => write!(f, "environment variable {} is not set", var),
            Self::Io(msg) => write!(f, "cannot read config: {}", msg),
            Self::Parse(msg) => write!(f, "cannot parse config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Everything a node needs to join the mesh.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// This node's address.
    pub node_id: u16,
    /// This node's role.
    pub role: NodeRole,
    /// Hop budget for packets this node originates.
    #[serde(default = "default_ttl")]
    pub default_ttl: u8,
    /// Peer count above which the seen cache evicts its oldest half.
    #[serde(default = "default_max_seen_peers")]
    pub max_seen_peers: usize,
    /// Wait per ACK attempt, in milliseconds.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Transmissions per reliable send, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
    /// Radio poll timeout of the receive loop, in milliseconds.
    #[serde(default = "default_rx_poll_ms")]
    pub rx_poll_ms: u64,
    /// Lower bound of the pre-transmit jitter, in milliseconds.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u32,
    /// Upper bound of the pre-transmit jitter, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u32,
    /// Bytes of hardware header the radio prepends to received frames.
    #[serde(default)]
    pub hw_header_len: usize,
    /// Port for the `/stats` HTTP endpoint; disabled when absent.
    #[serde(default)]
    pub stats_port: Option<u16>,
}

fn default_ttl() -> u8 {
    DEFAULT_TTL
}

fn default_max_seen_peers() -> usize {
    1_000
}

fn default_ack_timeout_ms() -> u64 {
    3_000
}

fn default_max_attempts() -> u8 {
    3
}

fn default_rx_poll_ms() -> u64 {
    100
}

fn default_min_delay_ms() -> u32 {
    10
}

fn default_max_delay_ms() -> u32 {
    150
}

impl NodeConfig {
    /// Create a configuration with default tuning.
    ///
    /// Returns an error if the node ID does not belong to the role.
    pub fn new(node_id: u16, role: NodeRole) -> Result<Self, ConfigError> {
        let config = Self {
            node_id,
            role,
            default_ttl: default_ttl(),
            max_seen_peers: default_max_seen_peers(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_attempts: default_max_attempts(),
            rx_poll_ms: default_rx_poll_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            hw_header_len: 0,
            stats_port: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Build the configuration from the environment.
    ///
    /// `MESH_CONFIG` names a JSON file and wins if set; otherwise
    /// `MESH_NODE_ID` and `MESH_ROLE` are required and everything else takes
    /// its default.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            return Self::load(Path::new(&path));
        }

        let node_id = std::env::var(ENV_NODE_ID)
            .map_err(|_| ConfigError::MissingEnv(ENV_NODE_ID))?
            .trim()
            .parse::<u16>()
            .map_err(|e| ConfigError::Parse(format!("{}: {}", ENV_NODE_ID, e)))?;
        let role = std::env::var(ENV_ROLE)
            .map_err(|_| ConfigError::MissingEnv(ENV_ROLE))?
            .parse::<NodeRole>()?;

        Self::new(node_id, role)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.role.accepts_id(self.node_id) {
            return Err(ConfigError::InvalidNodeId {
                node_id: self.node_id,
                role: self.role,
            });
        }
        if self.default_ttl == 0 {
            return Err(ConfigError::InvalidConfig("default_ttl must be > 0"));
        }
        if self.max_seen_peers < 2 || self.max_seen_peers > MAX_SEEN_PEERS_LIMIT {
            return Err(ConfigError::InvalidConfig(
                "max_seen_peers must be between 2 and 65536",
            ));
        }
        if self.rx_poll_ms == 0 {
            return Err(ConfigError::InvalidConfig("rx_poll_ms must be > 0"));
        }
        if self.hw_header_len > HEADER_SIZE + MAX_PAYLOAD {
            return Err(ConfigError::InvalidConfig(
                "hw_header_len exceeds the radio frame size",
            ));
        }
        self.retry_policy()
            .validate()
            .map_err(|_| ConfigError::InvalidConfig("max_attempts and ack_timeout_ms must be > 0"))?;
        self.collision_config()
            .validate()
            .map_err(|_| ConfigError::InvalidConfig("invalid collision-avoidance window"))?;
        Ok(())
    }

    /// Retry policy for reliable sends.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
        }
    }

    /// Collision-avoidance timing.
    pub fn collision_config(&self) -> CollisionConfig {
        CollisionConfig {
            min_delay_ms: self.min_delay_ms,
            max_delay_ms: self.max_delay_ms,
            ..CollisionConfig::default()
        }
    }

    /// Receive loop poll timeout.
    pub fn rx_poll(&self) -> Duration {
        Duration::from_millis(self.rx_poll_ms)
    }

    /// Minimum gap between two relays of the same packet by a repeater:
    /// half the ACK timeout, so echoes are suppressed but retransmissions
    /// get through.
    pub fn relay_holdoff(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_bands() {
        assert!(NodeRole::Server.accepts_id(1));
        assert!(NodeRole::Scanner.accepts_id(102));
        assert!(NodeRole::Repeater.accepts_id(200));
        assert!(!NodeRole::Server.accepts_id(0));
        assert!(!NodeRole::Repeater.accepts_id(102));
        assert!(!NodeRole::Scanner.accepts_id(200));
    }

    #[test]
    fn test_new_rejects_out_of_band_id() {
        assert_eq!(
            NodeConfig::new(150, NodeRole::Repeater),
            Err(ConfigError::InvalidNodeId {
                node_id: 150,
                role: NodeRole::Repeater
            })
        );
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::new(1, NodeRole::Server).unwrap();
        assert_eq!(config.default_ttl, DEFAULT_TTL);
        assert_eq!(config.max_seen_peers, 1_000);
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.retry_policy().ack_timeout, Duration::from_secs(3));
        assert_eq!(config.rx_poll(), Duration::from_millis(100));
    }

    #[test]
    fn test_from_json_minimal() {
        let config = NodeConfig::from_json(r#"{"node_id": 200, "role": "repeater"}"#).unwrap();
        assert_eq!(config.node_id, 200);
        assert_eq!(config.role, NodeRole::Repeater);
        assert_eq!(config.stats_port, None);
    }

    #[test]
    fn test_from_json_overrides() {
        let config = NodeConfig::from_json(
            r#"{"node_id": 1, "role": "server", "ack_timeout_ms": 500, "max_attempts": 5, "stats_port": 8080}"#,
        )
        .unwrap();
        assert_eq!(config.retry_policy().ack_timeout, Duration::from_millis(500));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.stats_port, Some(8080));
    }

    #[test]
    fn test_from_json_rejects_unknown_field() {
        let result = NodeConfig::from_json(r#"{"node_id": 1, "role": "server", "bogus": 1}"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_json_validates() {
        let result = NodeConfig::from_json(r#"{"node_id": 1, "role": "server", "max_attempts": 0}"#);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

        let result = NodeConfig::from_json(
            r#"{"node_id": 1, "role": "server", "min_delay_ms": 100, "max_delay_ms": 50}"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("Scanner".parse::<NodeRole>(), Ok(NodeRole::Scanner));
        assert_eq!(
            "gateway".parse::<NodeRole>(),
            Err(ConfigError::UnknownRole("gateway".to_string()))
        );
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::InvalidNodeId {
            node_id: 5,
            role: NodeRole::Repeater,
        };
        assert_eq!(
            format!("{}", err),
            "node id 5 is outside the repeater band 200-299"
        );
    }
}
