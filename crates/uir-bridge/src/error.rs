//! Bridge errors

use thiserror::Error;
use uir_proto::{ErrorKind, ProtoError, ReplyKey};

use crate::transport::TransportError;

/// Errors raised while translating and routing a request.
///
/// Each is reported back to the client as an ERROR_REPORT carrying
/// [`BridgeError::code`]. A receive failure on the bus additionally ends
/// every session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Message failed to decode or carried invalid fields
    #[error("Malformed message: {0}")]
    Malformed(#[from] ErrorKind),

    /// No CAN mapping for the logical address
    #[error("Unknown address {0}")]
    UnknownAddress(u8),

    /// Function code not implemented by the gateway itself
    #[error("Unknown command 0x{function_code:02X} for device {device_id}")]
    UnknownCommand { device_id: u8, function_code: u8 },

    /// Parameter value outside the allowed set
    #[error("Invalid value {value} for parameter {index}")]
    InvalidParameter { index: u8, value: u8 },

    /// Acknowledgement requested from the global group, which never replies
    /// under its own node ID
    #[error("Address {0} is the global group and cannot acknowledge")]
    BroadcastAck(u8),

    /// The same fragment index arrived twice
    #[error("Duplicate fragment {index} from {key}")]
    DuplicateFragment { key: ReplyKey, index: u8 },

    /// Fragment index beyond the declared end or capacity
    #[error("Fragment overflow from {key}: {reason}")]
    OutOfOrderOverflow { key: ReplyKey, reason: String },

    /// No complete reply before the deadline
    #[error("Timeout waiting for reply from {0}")]
    Timeout(ReplyKey),

    /// The CAN channel closed or failed; fatal to the whole bridge
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The bridge is shutting down
    #[error("Bridge shut down")]
    Shutdown,
}

impl BridgeError {
    /// Error code carried in an ERROR_REPORT reply
    pub fn code(&self) -> u8 {
        match self {
            BridgeError::Malformed(kind) => kind.code(),
            BridgeError::UnknownAddress(_) => 0x10,
            BridgeError::UnknownCommand { .. } => 0x11,
            BridgeError::InvalidParameter { .. } => 0x12,
            BridgeError::BroadcastAck(_) => 0x13,
            BridgeError::DuplicateFragment { .. } => 0x20,
            BridgeError::OutOfOrderOverflow { .. } => 0x21,
            BridgeError::Timeout(_) => 0x30,
            BridgeError::TransportFailure(_) => 0x40,
            BridgeError::Shutdown => 0x41,
        }
    }
}

impl From<ProtoError> for BridgeError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Malformed(kind) => BridgeError::Malformed(kind),
            ProtoError::Incomplete { got, .. } => BridgeError::Malformed(ErrorKind::BadLength(got)),
        }
    }
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        BridgeError::TransportFailure(err.to_string())
    }
}
