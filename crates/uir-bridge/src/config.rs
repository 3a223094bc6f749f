//! Bridge configuration
//!
//! Loaded from TOML. Every section has defaults so an empty file yields a
//! gateway on port 8888 with a virtual bus and no mapped nodes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uir_proto::constants::{node_id, CanBitrate, GatewayModel, Rs232Baud};

use crate::router::AddressMap;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// TCP listener
    #[serde(default)]
    pub listen: ListenConfig,
    /// The emulated gateway device
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Per-session limits
    #[serde(default)]
    pub session: SessionConfig,
    /// Bus multiplexer settings
    #[serde(default)]
    pub bus: BusConfig,
    /// CAN transport
    #[serde(default)]
    pub transport: TransportConfig,
    /// Logical address to node ID mapping
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl BridgeConfig {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Demo setup: two simulated motors on a virtual bus, mapped 1:1
    pub fn demo() -> Self {
        let sim_nodes = [5u8, 6];
        Self {
            transport: TransportConfig::Virtual(VirtualConfig {
                latency_ms: 2,
                nodes: sim_nodes
                    .iter()
                    .map(|&id| SimNodeConfig {
                        node_id: id,
                        serial_number: default_serial_number() + id as u32,
                    })
                    .collect(),
            }),
            nodes: sim_nodes
                .iter()
                .map(|&id| NodeConfig {
                    address: id,
                    node_id: id,
                    name: Some(format!("motor-{}", id)),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway.validate()?;

        if self.session.reply_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "session.reply_timeout_ms must be positive".to_string(),
            ));
        }
        if self.session.max_malformed == 0 {
            return Err(ConfigError::Invalid(
                "session.max_malformed must be positive".to_string(),
            ));
        }
        if self.session.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "session.max_in_flight must be positive".to_string(),
            ));
        }
        if self.bus.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "bus.queue_depth must be positive".to_string(),
            ));
        }

        if let TransportConfig::Virtual(cfg) = &self.transport {
            for node in &cfg.nodes {
                if node.node_id > node_id::MAX || node.node_id <= node_id::RESERVED_MAX {
                    return Err(ConfigError::Invalid(format!(
                        "simulated node ID {} must be in {}..={}",
                        node.node_id,
                        node_id::RESERVED_MAX + 1,
                        node_id::MAX
                    )));
                }
            }
        }

        AddressMap::from_config(&self.gateway, &self.nodes)?;
        Ok(())
    }
}

/// TCP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Socket address to bind
    #[serde(default = "default_listen_address")]
    pub address: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:8888".to_string()
}

/// The gateway the bridge presents itself as
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Node ID on both the UIMessage side and the CAN bus (1..=4).
    /// Defaults to the one documented for `model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u8>,
    /// Extra device ID the gateway answers on; defaults to `node_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u8>,
    /// Reported model, e.g. "uim2523"
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_serial_number")]
    pub serial_number: u32,
    #[serde(default = "default_manufacturer_id")]
    pub manufacturer_id: u16,
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    /// Reported CAN bitrate, e.g. "500k"
    #[serde(default = "default_can_bitrate")]
    pub can_bitrate: String,
    /// Reported RS-232 baud, e.g. 115200
    #[serde(default = "default_rs232_baud")]
    pub rs232_baud: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            group_id: None,
            model: default_model(),
            serial_number: default_serial_number(),
            manufacturer_id: default_manufacturer_id(),
            vendor_id: default_vendor_id(),
            can_bitrate: default_can_bitrate(),
            rs232_baud: default_rs232_baud(),
        }
    }
}

impl GatewayConfig {
    /// Configured node ID, else the model's default
    pub fn resolved_node_id(&self) -> Result<u8, ConfigError> {
        match self.node_id {
            Some(id) => Ok(id),
            None => Ok(self.parsed_model()?.default_node_id()),
        }
    }

    pub fn resolved_group_id(&self) -> Result<u8, ConfigError> {
        match self.group_id {
            Some(id) => Ok(id),
            None => self.resolved_node_id(),
        }
    }

    /// Device IDs answered by the gateway itself rather than the bus
    pub fn local_addresses(&self) -> Result<[u8; 3], ConfigError> {
        Ok([
            node_id::GLOBAL,
            self.resolved_node_id()?,
            self.resolved_group_id()?,
        ])
    }

    pub fn parsed_model(&self) -> Result<GatewayModel, ConfigError> {
        self.model.parse().map_err(ConfigError::Invalid)
    }

    pub fn parsed_can_bitrate(&self) -> Result<CanBitrate, ConfigError> {
        self.can_bitrate.parse().map_err(ConfigError::Invalid)
    }

    pub fn parsed_rs232_baud(&self) -> Result<Rs232Baud, ConfigError> {
        Rs232Baud::from_baud(self.rs232_baud).ok_or_else(|| {
            ConfigError::Invalid(format!("unsupported RS-232 baud {}", self.rs232_baud))
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let node = self.resolved_node_id()?;
        if node == node_id::GLOBAL || node > node_id::RESERVED_MAX {
            return Err(ConfigError::Invalid(format!(
                "gateway.node_id {} must be in 1..={}",
                node,
                node_id::RESERVED_MAX
            )));
        }
        let group = self.resolved_group_id()?;
        if group > node_id::MAX {
            return Err(ConfigError::Invalid(format!(
                "gateway.group_id {} exceeds {}",
                group,
                node_id::MAX
            )));
        }
        self.parsed_can_bitrate()?;
        self.parsed_rs232_baud()?;
        Ok(())
    }
}

fn default_model() -> String {
    "uim2523".to_string()
}

fn default_serial_number() -> u32 {
    1234512345
}

fn default_manufacturer_id() -> u16 {
    0x4141
}

fn default_vendor_id() -> u16 {
    0x4242
}

fn default_can_bitrate() -> String {
    "500k".to_string()
}

fn default_rs232_baud() -> u32 {
    115200
}

/// Per-session limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Time allowed for a complete reply, reset by each fragment
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Consecutive malformed messages before the session is closed
    #[serde(default = "default_max_malformed")]
    pub max_malformed: u32,
    /// Requests awaiting replies before reading pauses
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: default_reply_timeout_ms(),
            max_malformed: default_max_malformed(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl SessionConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

fn default_reply_timeout_ms() -> u64 {
    1000
}

fn default_max_malformed() -> u32 {
    8
}

fn default_max_in_flight() -> usize {
    16
}

/// Bus multiplexer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Submissions queued ahead of the bus task
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_queue_depth() -> usize {
    64
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Raw SocketCAN interface (Linux only)
    SocketCan(SocketCanConfig),
    /// In-process bus with simulated nodes
    Virtual(VirtualConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Virtual(VirtualConfig::default())
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    pub interface: String,
    /// Expected bus bitrate; the interface itself is configured with `ip link`
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

fn default_bitrate() -> u32 {
    500000
}

/// Virtual bus configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualConfig {
    /// Delay before a simulated node answers
    #[serde(default)]
    pub latency_ms: u64,
    /// Simulated nodes on the bus
    #[serde(default)]
    pub nodes: Vec<SimNodeConfig>,
}

/// A simulated node on the virtual bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimNodeConfig {
    pub node_id: u8,
    #[serde(default = "default_serial_number")]
    pub serial_number: u32,
}

/// Logical address mapping for one CAN node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address clients put in the UIMessage device ID
    pub address: u8,
    /// SimpleCAN node ID (0..=127)
    pub node_id: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
