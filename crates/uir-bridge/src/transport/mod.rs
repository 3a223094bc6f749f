//! CAN transport layer
//!
//! This module provides the byte-level CAN channels the bridge can drive:
//! - SocketCAN adapter for a real interface (Linux only)
//! - Virtual bus with simulated nodes answering commands
//! - Mock channel for tests
//!
//! # Example
//!
//! ```ignore
//! use uir_bridge::transport::create_transport;
//! use uir_bridge::config::TransportConfig;
//!
//! let config = TransportConfig::Virtual(Default::default());
//! let mut transport = create_transport(&config)?;
//! transport.send(&frame).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;
pub mod sim;
pub mod virtual_bus;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::CanTransport;
pub use error::TransportError;

use crate::config::TransportConfig;

/// Create a transport based on configuration
pub fn create_transport(
    config: &TransportConfig,
) -> Result<Box<dyn CanTransport>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            let transport = socketcan::SocketCanTransport::new(cfg)?;
            Ok(Box::new(transport))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::Virtual(cfg) => {
            let transport = virtual_bus::VirtualTransport::new(cfg)?;
            Ok(Box::new(transport))
        }
    }
}
