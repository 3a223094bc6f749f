//! uir-proto - wire codecs for UIROBOT CAN gateways
//!
//! A UIROBOT gateway (UIM2513, UIM2523, ...) speaks two protocols:
//!
//! ```text
//! ┌──────────────┐  UIMessage (16 B)  ┌─────────────┐  SimpleCAN3.0  ┌──────────────┐
//! │  TCP client  │ ─────────────────▶ │   Gateway   │ ─────────────▶ │  UIM342 node │
//! │              │ ◀───────────────── │             │ ◀───────────── │              │
//! └──────────────┘                    └─────────────┘  29-bit CAN ID └──────────────┘
//! ```
//!
//! - [`uimessage`] - the framed, checksummed message used on TCP/serial
//! - [`codec`] - a `tokio_util` codec that streams UIMessages over a socket
//! - [`simplecan`] - the arbitration-ID packing used on the CAN side
//! - [`constants`] - function codes and device constants
//!
//! Everything in this crate is pure: no I/O, no tasks, no global state.

pub mod codec;
pub mod constants;
pub mod error;
pub mod simplecan;
pub mod uimessage;

pub use codec::{Inbound, UiMessageCodec};
pub use error::{ErrorKind, ProtoError};
pub use simplecan::{CanFrame, FragmentTag, ReplyKey, Role, SimpleCanFrame, SimpleCanId};
pub use uimessage::{crc16, Decoded, StartOfMessage, UiMessage};

/// Maximum number of data bytes in a classic CAN frame
pub const CAN_MAX_DLEN: usize = 8;

/// Maximum number of CAN fragments a single message may span
pub const MAX_FRAGMENTS: usize = 16;

/// Maximum UIMessage payload length (bytes)
pub const MAX_PAYLOAD_LEN: usize = CAN_MAX_DLEN * MAX_FRAGMENTS;
