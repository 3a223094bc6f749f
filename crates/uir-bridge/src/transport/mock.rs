//! Mock CAN transport for testing
//!
//! [`pair`] returns the transport half handed to the bridge and a [`MockBus`]
//! handle a test uses to observe written frames and inject bus traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uir_proto::CanFrame;

use super::{CanTransport, TransportError};

/// Transport half of a mock CAN channel
pub struct MockTransport {
    sent_tx: mpsc::UnboundedSender<CanFrame>,
    inbound_rx: mpsc::UnboundedReceiver<CanFrame>,
    fail_sends: Arc<AtomicBool>,
}

/// Test handle for a mock CAN channel
pub struct MockBus {
    sent_rx: mpsc::UnboundedReceiver<CanFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<CanFrame>>,
    fail_sends: Arc<AtomicBool>,
}

/// Create a connected transport and its test handle
pub fn pair() -> (MockTransport, MockBus) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let fail_sends = Arc::new(AtomicBool::new(false));

    (
        MockTransport {
            sent_tx,
            inbound_rx,
            fail_sends: fail_sends.clone(),
        },
        MockBus {
            sent_rx,
            inbound_tx: Some(inbound_tx),
            fail_sends,
        },
    )
}

impl MockBus {
    /// Wait for the next frame the bridge wrote
    pub async fn next_sent(&mut self) -> Option<CanFrame> {
        self.sent_rx.recv().await
    }

    /// Next written frame if one is already queued
    pub fn try_next_sent(&mut self) -> Option<CanFrame> {
        self.sent_rx.try_recv().ok()
    }

    /// Deliver a frame to the bridge as if a node had sent it
    pub fn inject(&self, frame: CanFrame) {
        if let Some(tx) = &self.inbound_tx {
            let _ = tx.send(frame);
        }
    }

    /// Make every following `send` fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Close the receive side; the bridge sees the bus go away
    pub fn disconnect(&mut self) {
        self.inbound_tx = None;
    }
}

#[async_trait]
impl CanTransport for MockTransport {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("mock send failure".to_string()));
        }
        tracing::trace!(id = format_args!("0x{:08X}", frame.id()), "Mock frame sent");
        // A dropped handle only means nobody is watching
        let _ = self.sent_tx.send(*frame);
        Ok(())
    }

    async fn recv(&mut self) -> Result<CanFrame, TransportError> {
        self.inbound_rx
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> CanFrame {
        CanFrame::new_extended(0x0428_008B, &[]).unwrap()
    }

    #[tokio::test]
    async fn records_sent_and_delivers_injected_frames() {
        let (mut transport, mut bus) = pair();

        transport.send(&frame()).await.unwrap();
        assert_eq!(bus.next_sent().await, Some(frame()));

        bus.inject(frame());
        assert_eq!(transport.recv().await.unwrap(), frame());
    }

    #[tokio::test]
    async fn disconnect_closes_receive_side() {
        let (mut transport, mut bus) = pair();
        bus.disconnect();
        assert_eq!(
            transport.recv().await,
            Err(TransportError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn send_failure_is_reported() {
        let (mut transport, mut bus) = pair();
        bus.set_fail_sends(true);
        assert!(matches!(
            transport.send(&frame()).await,
            Err(TransportError::SendFailed(_))
        ));
        assert!(bus.try_next_sent().is_none());
    }
}
