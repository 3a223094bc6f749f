//! Logical address to CAN node mapping
//!
//! Clients address devices by the UIMessage device ID. The bridge maps each
//! configured logical address to exactly one SimpleCAN node ID and back.

use std::collections::HashMap;

use uir_proto::constants::node_id;
use uir_proto::SimpleCanId;

use crate::config::{ConfigError, GatewayConfig, NodeConfig};
use crate::error::BridgeError;

/// Bijective mapping between logical addresses and CAN node IDs
#[derive(Debug, Clone)]
pub struct AddressMap {
    local_node: u8,
    to_node: HashMap<u8, u8>,
    to_address: HashMap<u8, u8>,
}

impl AddressMap {
    /// Build a map for a bridge that transmits as `local_node`.
    ///
    /// The local node and the global group are answered by the gateway and
    /// cannot be mapped.
    pub fn new(
        local_node: u8,
        entries: impl IntoIterator<Item = (u8, u8)>,
    ) -> Result<Self, ConfigError> {
        let mut to_node = HashMap::new();
        let mut to_address = HashMap::new();

        for (address, node) in entries {
            if address == local_node || address == node_id::GLOBAL {
                return Err(ConfigError::Invalid(format!(
                    "address {} is answered by the gateway itself",
                    address
                )));
            }
            if node > node_id::MAX {
                return Err(ConfigError::Invalid(format!(
                    "node ID {} for address {} exceeds {}",
                    node,
                    address,
                    node_id::MAX
                )));
            }
            if node != node_id::GLOBAL && node <= node_id::RESERVED_MAX {
                return Err(ConfigError::Invalid(format!(
                    "node ID {} for address {} is reserved for controllers",
                    node, address
                )));
            }
            if to_node.insert(address, node).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "address {} mapped more than once",
                    address
                )));
            }
            if let Some(other) = to_address.insert(node, address) {
                return Err(ConfigError::Invalid(format!(
                    "node ID {} mapped from both {} and {}",
                    node, other, address
                )));
            }
        }

        Ok(Self {
            local_node,
            to_node,
            to_address,
        })
    }

    pub fn from_config(gateway: &GatewayConfig, nodes: &[NodeConfig]) -> Result<Self, ConfigError> {
        let local = gateway.local_addresses()?;
        if let Some(node) = nodes.iter().find(|n| local.contains(&n.address)) {
            return Err(ConfigError::Invalid(format!(
                "address {} is answered by the gateway itself",
                node.address
            )));
        }
        Self::new(
            gateway.resolved_node_id()?,
            nodes.iter().map(|n| (n.address, n.node_id)),
        )
    }

    /// Node ID the bridge transmits as
    pub fn local_node(&self) -> u8 {
        self.local_node
    }

    pub fn len(&self) -> usize {
        self.to_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_node.is_empty()
    }

    pub fn node_id(&self, address: u8) -> Result<u8, BridgeError> {
        self.to_node
            .get(&address)
            .copied()
            .ok_or(BridgeError::UnknownAddress(address))
    }

    /// Base identifier for commands to `address`, control word zero
    pub fn base_id(&self, address: u8) -> Result<SimpleCanId, BridgeError> {
        let node = self.node_id(address)?;
        Ok(SimpleCanId::new(self.local_node, node, 0)?)
    }

    /// Base 29-bit arbitration ID for commands to `address`
    pub fn to_can_id(&self, address: u8) -> Result<u32, BridgeError> {
        Ok(self.base_id(address)?.to_raw())
    }

    /// Logical address of a node ID
    pub fn address_of(&self, node: u8) -> Result<u8, BridgeError> {
        self.to_address
            .get(&node)
            .copied()
            .ok_or(BridgeError::UnknownAddress(node))
    }

    /// Logical address of the node that produced a frame
    pub fn to_logical(&self, arbitration_id: u32) -> Result<u8, BridgeError> {
        let id = SimpleCanId::from_raw(arbitration_id)?;
        self.address_of(id.producer())
    }
}
