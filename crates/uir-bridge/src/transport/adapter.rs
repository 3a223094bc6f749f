//! CAN transport trait

use async_trait::async_trait;
use uir_proto::CanFrame;

use super::TransportError;

/// Raw CAN frame channel the bus multiplexer drives.
///
/// The multiplexer owns the transport exclusively and interleaves `send`
/// with `recv` inside a `select!`, so `recv` must be cancel-safe: dropping
/// the future before it completes must not lose a frame.
///
/// Any error returned from `recv` is treated as the bus being gone.
#[async_trait]
pub trait CanTransport: Send {
    /// Write one frame to the bus
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Wait for the next frame from the bus
    async fn recv(&mut self) -> Result<CanFrame, TransportError>;

    /// Human readable name for logs
    fn name(&self) -> String;
}
