//! UIMessage - the framed message spoken on the TCP side of a gateway
//!
//! # Wire format
//!
//! ```text
//! ┌──────┬────────┬─────────┬─────┬──────────────┬─────┬──────────┬──────┐
//! │ SOM  │ device │ control │ len │ data (8 B)   │ aux │ CRC16 LE │ EOM  │
//! │ 0xAA │   id   │ A|func  │     │ zero padded  │     │          │ 0xCC │
//! └──────┴────────┴─────────┴─────┴──────────────┴─────┴──────────┴──────┘
//!   0      1        2         3     4..12          12    13..15     15
//! ```
//!
//! The vendor format is fixed at 16 bytes. Payloads that do not fit in a
//! single CAN frame widen the data field to exactly `len` bytes, so the
//! frame grows to `8 + len` bytes. Messages with `len <= 8` are unchanged.
//!
//! The checksum is CRC-16/MODBUS over everything between SOM and the
//! checksum itself. It is only present when SOM is `0xAA`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use crate::constants::{function_code, ACK_BIT, FUNCTION_CODE_MASK};
use crate::error::{ErrorKind, ProtoError};
use crate::{CAN_MAX_DLEN, MAX_PAYLOAD_LEN};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// End-of-message marker
pub const EOM: u8 = 0xCC;

/// Length of a standard (vendor) UIMessage
pub const UI_MESSAGE_LEN: usize = 16;

/// SOM, device id, control word, data length
const HEADER_LEN: usize = 4;

/// aux byte, checksum, EOM
const TRAILER_LEN: usize = 4;

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Total encoded length of a message carrying `data_len` payload bytes
pub fn frame_len(data_len: usize) -> usize {
    HEADER_LEN + data_len.max(CAN_MAX_DLEN) + TRAILER_LEN
}

/// Whether the first 16 bytes already read as a complete vendor frame:
/// EOM in its last byte and nothing or another start byte after it
fn looks_like_vendor_frame(buf: &[u8]) -> bool {
    buf.len() >= UI_MESSAGE_LEN
        && buf[UI_MESSAGE_LEN - 1] == EOM
        && buf
            .get(UI_MESSAGE_LEN)
            .map_or(true, |b| StartOfMessage::from_byte(*b).is_some())
}

/// Start-of-message byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOfMessage {
    /// `0xAA`: checksum present and verified
    #[default]
    Checksummed,
    /// `0xAD`: no checksum
    Unchecked,
    /// `0xAC`: seen on the wire, meaning unknown; handled like `Unchecked`
    Reserved,
}

impl StartOfMessage {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0xAA => Some(StartOfMessage::Checksummed),
            0xAD => Some(StartOfMessage::Unchecked),
            0xAC => Some(StartOfMessage::Reserved),
            _ => None,
        }
    }

    pub fn byte(&self) -> u8 {
        match self {
            StartOfMessage::Checksummed => 0xAA,
            StartOfMessage::Unchecked => 0xAD,
            StartOfMessage::Reserved => 0xAC,
        }
    }

    pub fn has_checksum(&self) -> bool {
        matches!(self, StartOfMessage::Checksummed)
    }
}

/// Outcome of decoding the front of a byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A verified message and the number of bytes it occupied
    Message(UiMessage, usize),
    /// The buffer holds a prefix of a message
    NeedMoreData,
    /// The front of the buffer is not a valid message.
    ///
    /// `consumed` bytes should be discarded before decoding again; it never
    /// reaches past the malformed unit.
    Malformed { kind: ErrorKind, consumed: usize },
}

/// A single UIMessage.
///
/// The checksum is not stored; it is a function of the other fields and is
/// recomputed on encode and verified on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiMessage {
    start: StartOfMessage,
    device_id: u8,
    function_code: u8,
    need_ack: bool,
    sequence_tag: u8,
    data: Bytes,
}

impl UiMessage {
    /// Create a checksummed message without the ACK bit
    pub fn new(device_id: u8, function_code: u8, data: impl Into<Bytes>) -> Result<Self, ProtoError> {
        let data = data.into();
        if function_code > FUNCTION_CODE_MASK {
            return Err(ErrorKind::BadFunctionCode(function_code).into());
        }
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(ErrorKind::BadLength(data.len()).into());
        }
        Ok(Self {
            start: StartOfMessage::Checksummed,
            device_id,
            function_code,
            need_ack: false,
            sequence_tag: 0,
            data,
        })
    }

    /// Create a message from a raw control word (ACK bit + function code)
    pub fn from_control_word(
        device_id: u8,
        control_word: u8,
        data: impl Into<Bytes>,
    ) -> Result<Self, ProtoError> {
        Ok(Self::new(device_id, control_word & FUNCTION_CODE_MASK, data)?
            .with_ack(control_word & ACK_BIT != 0))
    }

    /// ERROR_REPORT carrying an error code and the control word it concerns
    pub fn error_report(device_id: u8, error_code: u8, offending_control_word: u8) -> Self {
        Self {
            start: StartOfMessage::Checksummed,
            device_id,
            function_code: function_code::ERROR_REPORT,
            need_ack: false,
            sequence_tag: 0,
            data: Bytes::copy_from_slice(&[error_code, offending_control_word]),
        }
    }

    pub fn with_ack(mut self, need_ack: bool) -> Self {
        self.need_ack = need_ack;
        self
    }

    pub fn with_sequence_tag(mut self, tag: u8) -> Self {
        self.sequence_tag = tag;
        self
    }

    pub fn with_start(mut self, start: StartOfMessage) -> Self {
        self.start = start;
        self
    }

    pub fn start(&self) -> StartOfMessage {
        self.start
    }

    /// Logical device address: destination on requests, source on replies
    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn function_code(&self) -> u8 {
        self.function_code
    }

    pub fn need_ack(&self) -> bool {
        self.need_ack
    }

    pub fn control_word(&self) -> u8 {
        if self.need_ack {
            self.function_code | ACK_BIT
        } else {
            self.function_code
        }
    }

    /// Auxiliary byte, used to correlate a reply with its request
    pub fn sequence_tag(&self) -> u8 {
        self.sequence_tag
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Number of bytes this message occupies on the wire
    pub fn encoded_len(&self) -> usize {
        frame_len(self.data.len())
    }

    /// Checksum as it would appear on the wire (0 for unchecked messages)
    pub fn checksum(&self) -> u16 {
        if !self.start.has_checksum() {
            return 0;
        }
        let padding = [0u8; CAN_MAX_DLEN];
        let pad = CAN_MAX_DLEN.saturating_sub(self.data.len());

        let mut digest = CRC16.digest();
        digest.update(&[self.device_id, self.control_word(), self.data.len() as u8]);
        digest.update(&self.data);
        digest.update(&padding[..pad]);
        digest.update(&[self.sequence_tag]);
        digest.finalize()
    }

    /// Append the encoded message to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        let pad = CAN_MAX_DLEN.saturating_sub(self.data.len());

        dst.reserve(self.encoded_len());
        dst.put_u8(self.start.byte());
        dst.put_u8(self.device_id);
        dst.put_u8(self.control_word());
        dst.put_u8(self.data.len() as u8);
        dst.put_slice(&self.data);
        dst.put_bytes(0, pad);
        dst.put_u8(self.sequence_tag);
        dst.put_u16_le(self.checksum());
        dst.put_u8(EOM);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one message from the front of `buf`
    pub fn decode(buf: &[u8]) -> Decoded {
        let Some(&first) = buf.first() else {
            return Decoded::NeedMoreData;
        };

        let Some(start) = StartOfMessage::from_byte(first) else {
            // Skip ahead to the next byte that could start a message
            let consumed = buf[1..]
                .iter()
                .position(|b| StartOfMessage::from_byte(*b).is_some())
                .map(|p| p + 1)
                .unwrap_or(buf.len());
            return Decoded::Malformed {
                kind: ErrorKind::BadStartOfMessage(first),
                consumed,
            };
        };

        if buf.len() < HEADER_LEN {
            return Decoded::NeedMoreData;
        }

        let data_len = buf[3] as usize;
        if data_len > MAX_PAYLOAD_LEN {
            return Decoded::Malformed {
                kind: ErrorKind::BadLength(data_len),
                consumed: 1,
            };
        }

        let total = frame_len(data_len);
        if buf.len() < total {
            if data_len > CAN_MAX_DLEN && looks_like_vendor_frame(buf) {
                // A corrupted length byte must not stall the stream
                return Decoded::Malformed {
                    kind: ErrorKind::BadLength(data_len),
                    consumed: 1,
                };
            }
            return Decoded::NeedMoreData;
        }

        let frame = &buf[..total];
        let eom = frame[total - 1];
        if eom != EOM {
            return Decoded::Malformed {
                kind: ErrorKind::BadEndOfMessage(eom),
                consumed: 1,
            };
        }

        let aux_at = HEADER_LEN + data_len.max(CAN_MAX_DLEN);
        if start.has_checksum() {
            let actual = u16::from_le_bytes([frame[aux_at + 1], frame[aux_at + 2]]);
            let expected = crc16(&frame[1..=aux_at]);
            if actual != expected {
                return Decoded::Malformed {
                    kind: ErrorKind::ChecksumMismatch { expected, actual },
                    consumed: total,
                };
            }
        }

        let control = frame[2];
        let msg = UiMessage {
            start,
            device_id: frame[1],
            function_code: control & FUNCTION_CODE_MASK,
            need_ack: control & ACK_BIT != 0,
            sequence_tag: frame[aux_at],
            data: Bytes::copy_from_slice(&frame[HEADER_LEN..HEADER_LEN + data_len]),
        };

        Decoded::Message(msg, total)
    }

    /// Decode a buffer that must hold exactly one message
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtoError> {
        match Self::decode(buf) {
            Decoded::Message(msg, consumed) if consumed == buf.len() => Ok(msg),
            Decoded::Message(_, consumed) => Err(ErrorKind::BadLength(buf.len() - consumed).into()),
            Decoded::NeedMoreData => Err(ProtoError::Incomplete {
                need: buf.get(3).map(|&n| frame_len(n as usize)).unwrap_or(UI_MESSAGE_LEN),
                got: buf.len(),
            }),
            Decoded::Malformed { kind, .. } => Err(kind.into()),
        }
    }
}

impl fmt::Display for UiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UiMessage(dev={} fc=0x{:02X}{} tag={} data={:02X?})",
            self.device_id,
            self.function_code,
            if self.need_ack { " ack" } else { "" },
            self.sequence_tag,
            self.data.as_ref()
        )
    }
}
