//! Protocol errors

use thiserror::Error;

/// Why a unit of input was rejected by one of the codecs.
///
/// Every variant is local to a single message or frame; none of them
/// imply the stream itself is unusable.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Bad start-of-message byte 0x{0:02X}")]
    BadStartOfMessage(u8),

    #[error("Bad end-of-message byte 0x{0:02X}")]
    BadEndOfMessage(u8),

    #[error("Bad data length {0}")]
    BadLength(usize),

    #[error("Function code 0x{0:02X} out of range")]
    BadFunctionCode(u8),

    #[error("Standard (11-bit) identifier 0x{0:03X} is not SimpleCAN3.0")]
    StandardId(u32),

    #[error("Reserved identifier bits set in 0x{0:08X}")]
    ReservedBits(u32),

    #[error("Identifier 0x{0:08X} out of range")]
    IdOutOfRange(u32),
}

impl ErrorKind {
    /// Error code carried in an ERROR_REPORT reply
    pub fn code(&self) -> u8 {
        match self {
            ErrorKind::ChecksumMismatch { .. } => 0x01,
            ErrorKind::BadStartOfMessage(_) => 0x02,
            ErrorKind::BadEndOfMessage(_) => 0x03,
            ErrorKind::BadLength(_) | ErrorKind::BadFunctionCode(_) => 0x04,
            ErrorKind::StandardId(_) | ErrorKind::ReservedBits(_) | ErrorKind::IdOutOfRange(_) => {
                0x05
            }
        }
    }
}

/// Errors returned by fallible constructors and decoders in this crate
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Malformed: {0}")]
    Malformed(#[from] ErrorKind),

    #[error("Incomplete: need {need} bytes, got {got}")]
    Incomplete { need: usize, got: usize },
}
