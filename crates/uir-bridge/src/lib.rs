//! UIROBOT gateway bridge
//!
//! Emulates a UIM2523-style gateway: clients connect over TCP and speak
//! UIMessage, the bridge translates each request into SimpleCAN3.0 frames
//! on a CAN bus and routes the replies back to the session that asked.
//!
//! # Architecture
//!
//! ```text
//!  TCP clients                                          CAN bus
//!  ───────────                                          ───────
//!  ┌─────────┐   UIMessage   ┌───────────┐
//!  │ Session ├──────────────►│ Translator│  AddressMap
//!  └────┬────┘               └─────┬─────┘
//!       │ GatewayDevice            │ frames + ReplyKey
//!       │ (local replies)          ▼
//!  ┌────┴────┐   oneshot    ┌──────────────┐   CanTransport   ┌──────┐
//!  │ Session │◄─────────────┤BusMultiplexer├─────────────────►│ node │
//!  └─────────┘              │ reassembly   │◄─────────────────┤ node │
//!                           └──────────────┘                  └──────┘
//! ```
//!
//! - [`router`] maps logical device IDs to CAN node IDs
//! - [`translate`] converts requests to frames and replies back to messages
//! - [`reassembly`] collects multi-frame replies
//! - [`bus`] owns the transport and matches replies to waiters
//! - [`session`] serves one TCP connection
//! - [`server`] accepts connections and supervises the bus task

pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod reassembly;
pub mod router;
pub mod server;
pub mod session;
pub mod translate;
pub mod transport;

pub use bus::{BusHandle, BusMultiplexer, BusStatus, SessionId};
pub use config::{BridgeConfig, ConfigError, TransportConfig};
pub use device::GatewayDevice;
pub use error::BridgeError;
pub use reassembly::{CompletedReply, ReassemblyContext, ReassemblyState};
pub use router::AddressMap;
pub use server::Bridge;
pub use session::{Session, SessionState};
pub use translate::{OutboundRequest, Translator};
pub use transport::{create_transport, CanTransport, TransportError};
