//! In-process CAN bus populated by simulated nodes

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uir_proto::constants::node_id;
use uir_proto::CanFrame;

use super::sim::SimulatedNode;
use super::{CanTransport, TransportError};
use crate::config::VirtualConfig;

/// Transport whose only peers are [`SimulatedNode`]s
pub struct VirtualTransport {
    nodes: Vec<SimulatedNode>,
    latency: Duration,
    replies_tx: mpsc::UnboundedSender<CanFrame>,
    replies_rx: mpsc::UnboundedReceiver<CanFrame>,
}

impl VirtualTransport {
    pub fn new(config: &VirtualConfig) -> Result<Self, TransportError> {
        let mut seen = HashSet::new();
        for node in &config.nodes {
            if node.node_id > node_id::MAX {
                return Err(TransportError::InvalidConfig(format!(
                    "simulated node ID {} out of range",
                    node.node_id
                )));
            }
            if !seen.insert(node.node_id) {
                return Err(TransportError::InvalidConfig(format!(
                    "simulated node ID {} listed twice",
                    node.node_id
                )));
            }
        }

        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        tracing::info!(
            nodes = ?config.nodes.iter().map(|n| n.node_id).collect::<Vec<_>>(),
            latency_ms = config.latency_ms,
            "Virtual CAN bus created"
        );

        Ok(Self {
            nodes: config.nodes.iter().map(SimulatedNode::new).collect(),
            latency: Duration::from_millis(config.latency_ms),
            replies_tx,
            replies_rx,
        })
    }
}

#[async_trait]
impl CanTransport for VirtualTransport {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        for node in &mut self.nodes {
            let replies = node.handle(frame);
            if replies.is_empty() {
                continue;
            }
            tracing::trace!(node = node.node_id(), frames = replies.len(), "Simulated reply");

            if self.latency.is_zero() {
                for reply in replies {
                    let _ = self.replies_tx.send(reply);
                }
            } else {
                let tx = self.replies_tx.clone();
                let latency = self.latency;
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    for reply in replies {
                        let _ = tx.send(reply);
                    }
                });
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<CanFrame, TransportError> {
        self.replies_rx
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    fn name(&self) -> String {
        format!("virtual({} nodes)", self.nodes.len())
    }
}
