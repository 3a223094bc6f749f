//! SimpleCAN3.0 - the protocol spoken on the CAN side of a gateway
//!
//! SimpleCAN carries no checksum or framing bytes of its own. Addressing
//! and the command are packed into the 29-bit extended arbitration ID; the
//! CAN payload is data only.
//!
//! ```text
//!    28..24     23..19   18  17..16    15..14   13   12   11..8     7..0
//!  ┌─────────┬─────────┬───┬─────────┬─────────┬───┬────┬───────┬─────────┐
//!  │producer │consumer │ 0 │producer │consumer │ 0 │more│ index │ control │
//!  │ low 5   │ low 5   │   │ high 2  │ high 2  │   │    │       │  word   │
//!  └─────────┴─────────┴───┴─────────┴─────────┴───┴────┴───────┴─────────┘
//! ```
//!
//! In the vendor layout bits 8..13 are always zero. A payload longer than
//! one CAN frame is sent as consecutive frames whose `index` counts up from
//! zero; `more` is set on every frame except the last. Single-frame traffic
//! therefore stays identical to the vendor layout.

use crate::constants::{node_id, ACK_BIT, FUNCTION_CODE_MASK};
use crate::error::ErrorKind;
use crate::{CAN_MAX_DLEN, MAX_FRAGMENTS};

/// Largest 11-bit identifier
pub const STANDARD_ID_MAX: u32 = 0x7FF;

/// Largest 29-bit identifier
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

const PRODUCER_LO_SHIFT: u32 = 24;
const CONSUMER_LO_SHIFT: u32 = 19;
const PRODUCER_HI_SHIFT: u32 = 16;
const CONSUMER_HI_SHIFT: u32 = 14;
const MORE_FRAGMENTS_BIT: u32 = 1 << 12;
const INDEX_SHIFT: u32 = 8;
const INDEX_MASK: u32 = 0x0F;
const RESERVED_BITS: u32 = (1 << 18) | (1 << 13);

/// A classic CAN frame.
///
/// Data is held inline so frames can be built and decoded without touching
/// the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanFrame {
    id: u32,
    data: [u8; CAN_MAX_DLEN],
    len: u8,
    extended: bool,
}

impl CanFrame {
    /// Create a frame with a 29-bit identifier
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, ErrorKind> {
        if id > EXTENDED_ID_MAX {
            return Err(ErrorKind::IdOutOfRange(id));
        }
        Self::build(id, data, true)
    }

    /// Create a frame with an 11-bit identifier
    pub fn new_standard(id: u32, data: &[u8]) -> Result<Self, ErrorKind> {
        if id > STANDARD_ID_MAX {
            return Err(ErrorKind::IdOutOfRange(id));
        }
        Self::build(id, data, false)
    }

    fn build(id: u32, data: &[u8], extended: bool) -> Result<Self, ErrorKind> {
        if data.len() > CAN_MAX_DLEN {
            return Err(ErrorKind::BadLength(data.len()));
        }
        let mut buf = [0u8; CAN_MAX_DLEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            data: buf,
            len: data.len() as u8,
            extended,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

/// Position of a frame within a multi-frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FragmentTag {
    /// Zero-based fragment index
    pub index: u8,
    /// Another fragment follows this one
    pub more: bool,
}

impl FragmentTag {
    /// Tag of a payload that fits in one frame
    pub const SINGLE: FragmentTag = FragmentTag {
        index: 0,
        more: false,
    };

    pub fn is_last(&self) -> bool {
        !self.more
    }
}

/// Whether a frame travels from a controller to a node or back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Produced by a controller or gateway (reserved node IDs 1..=4)
    Command,
    /// Produced by a node
    Reply,
}

/// Key under which reply fragments are collected: who sent it and what for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplyKey {
    pub node: u8,
    pub function_code: u8,
}

impl std::fmt::Display for ReplyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {}/fc 0x{:02X}", self.node, self.function_code)
    }
}

/// Fields packed into a SimpleCAN3.0 arbitration ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimpleCanId {
    producer: u8,
    consumer: u8,
    control_word: u8,
    fragment: FragmentTag,
}

impl SimpleCanId {
    pub fn new(producer: u8, consumer: u8, control_word: u8) -> Result<Self, ErrorKind> {
        for id in [producer, consumer] {
            if id > node_id::MAX {
                return Err(ErrorKind::IdOutOfRange(id as u32));
            }
        }
        Ok(Self {
            producer,
            consumer,
            control_word,
            fragment: FragmentTag::SINGLE,
        })
    }

    pub fn with_fragment(mut self, fragment: FragmentTag) -> Result<Self, ErrorKind> {
        if fragment.index as usize >= MAX_FRAGMENTS {
            return Err(ErrorKind::IdOutOfRange(fragment.index as u32));
        }
        self.fragment = fragment;
        Ok(self)
    }

    /// Same identifier with a different control word
    pub fn with_control_word(mut self, control_word: u8) -> Self {
        self.control_word = control_word;
        self
    }

    pub fn producer(&self) -> u8 {
        self.producer
    }

    pub fn consumer(&self) -> u8 {
        self.consumer
    }

    pub fn control_word(&self) -> u8 {
        self.control_word
    }

    pub fn function_code(&self) -> u8 {
        self.control_word & FUNCTION_CODE_MASK
    }

    pub fn need_ack(&self) -> bool {
        self.control_word & ACK_BIT != 0
    }

    pub fn fragment(&self) -> FragmentTag {
        self.fragment
    }

    pub fn role(&self) -> Role {
        if (1..=node_id::RESERVED_MAX).contains(&self.producer) {
            Role::Command
        } else {
            Role::Reply
        }
    }

    pub fn reply_key(&self) -> ReplyKey {
        ReplyKey {
            node: self.producer,
            function_code: self.function_code(),
        }
    }

    pub fn to_raw(&self) -> u32 {
        let p = self.producer as u32;
        let c = self.consumer as u32;

        let mut raw = ((p & 0x1F) << PRODUCER_LO_SHIFT)
            | ((c & 0x1F) << CONSUMER_LO_SHIFT)
            | (((p >> 5) & 0x03) << PRODUCER_HI_SHIFT)
            | (((c >> 5) & 0x03) << CONSUMER_HI_SHIFT)
            | ((self.fragment.index as u32 & INDEX_MASK) << INDEX_SHIFT)
            | self.control_word as u32;
        if self.fragment.more {
            raw |= MORE_FRAGMENTS_BIT;
        }
        raw
    }

    pub fn from_raw(raw: u32) -> Result<Self, ErrorKind> {
        if raw > EXTENDED_ID_MAX {
            return Err(ErrorKind::IdOutOfRange(raw));
        }
        if raw & RESERVED_BITS != 0 {
            return Err(ErrorKind::ReservedBits(raw));
        }

        let p_lo = (raw >> PRODUCER_LO_SHIFT) & 0x1F;
        let c_lo = (raw >> CONSUMER_LO_SHIFT) & 0x1F;
        let p_hi = (raw >> PRODUCER_HI_SHIFT) & 0x03;
        let c_hi = (raw >> CONSUMER_HI_SHIFT) & 0x03;

        Ok(Self {
            producer: ((p_hi << 5) | p_lo) as u8,
            consumer: ((c_hi << 5) | c_lo) as u8,
            control_word: (raw & 0xFF) as u8,
            fragment: FragmentTag {
                index: ((raw >> INDEX_SHIFT) & INDEX_MASK) as u8,
                more: raw & MORE_FRAGMENTS_BIT != 0,
            },
        })
    }
}

/// A CAN frame interpreted as SimpleCAN3.0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleCanFrame {
    id: SimpleCanId,
    data: [u8; CAN_MAX_DLEN],
    len: u8,
}

impl SimpleCanFrame {
    pub fn new(id: SimpleCanId, data: &[u8]) -> Result<Self, ErrorKind> {
        if data.len() > CAN_MAX_DLEN {
            return Err(ErrorKind::BadLength(data.len()));
        }
        let mut buf = [0u8; CAN_MAX_DLEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            data: buf,
            len: data.len() as u8,
        })
    }

    pub fn id(&self) -> &SimpleCanId {
        &self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn decode(frame: &CanFrame) -> Result<Self, ErrorKind> {
        if !frame.is_extended() {
            return Err(ErrorKind::StandardId(frame.id()));
        }
        Ok(Self {
            id: SimpleCanId::from_raw(frame.id())?,
            data: frame.data,
            len: frame.len,
        })
    }

    pub fn encode(&self) -> CanFrame {
        CanFrame {
            id: self.id.to_raw(),
            data: self.data,
            len: self.len,
            extended: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbitration_id_layout() {
        let cases = [
            (4, 5, 0x8B, 0x0428_008B),
            (2, 6, 0x0C, 0x0230_000C),
            (5, 4, 0x0B, 0x0520_000B),
            (100, 4, 0x01, 0x0423_0001),
            (4, 127, 0x81, 0x04F8_C081),
        ];

        for (producer, consumer, control_word, raw) in cases {
            let id = SimpleCanId::new(producer, consumer, control_word).unwrap();
            assert_eq!(id.to_raw(), raw, "producer {} consumer {}", producer, consumer);
            assert_eq!(SimpleCanId::from_raw(raw).unwrap(), id);
        }
    }

    #[test]
    fn fragment_fields_use_reserved_zero_bits() {
        let id = SimpleCanId::new(4, 5, 0x8B)
            .unwrap()
            .with_fragment(FragmentTag { index: 3, more: true })
            .unwrap();
        assert_eq!(id.to_raw(), 0x0428_138B);

        let decoded = SimpleCanId::from_raw(0x0428_138B).unwrap();
        assert_eq!(decoded.fragment(), FragmentTag { index: 3, more: true });
        assert_eq!(decoded.function_code(), 0x0B);
        assert!(decoded.need_ack());
    }

    #[test]
    fn role_follows_producer() {
        let command = SimpleCanId::new(4, 5, 0x0B).unwrap();
        let reply = SimpleCanId::new(5, 4, 0x0B).unwrap();
        assert_eq!(command.role(), Role::Command);
        assert_eq!(reply.role(), Role::Reply);
        assert_eq!(
            reply.reply_key(),
            ReplyKey {
                node: 5,
                function_code: 0x0B
            }
        );
    }

    #[test]
    fn frame_round_trip() {
        for (producer, consumer) in [(2, 17), (4, 5), (5, 4), (0, 127), (127, 0), (33, 96)] {
            for index in [0u8, 1, 7, 15] {
                for more in [false, true] {
                    let tag = FragmentTag { index, more };
                    let id = SimpleCanId::new(producer, consumer, 0x8C)
                        .unwrap()
                        .with_fragment(tag)
                        .unwrap();
                    let frame = SimpleCanFrame::new(id, &[index, producer, consumer]).unwrap();
                    let can = frame.encode();

                    assert!(can.is_extended());
                    assert_eq!(can.data(), &[index, producer, consumer]);
                    let decoded = SimpleCanFrame::decode(&can).unwrap();
                    assert_eq!(decoded, frame);
                    assert_eq!(decoded.id().producer(), producer);
                    assert_eq!(decoded.id().consumer(), consumer);
                    assert_eq!(decoded.id().fragment(), tag);
                    assert_eq!(decoded.id().control_word(), 0x8C);
                }
            }
        }
    }

    #[test]
    fn decode_rejects_standard_id() {
        let can = CanFrame::new_standard(0x123, &[0]).unwrap();
        assert_eq!(
            SimpleCanFrame::decode(&can),
            Err(ErrorKind::StandardId(0x123))
        );
    }

    #[test]
    fn decode_rejects_reserved_bits() {
        assert_eq!(
            SimpleCanId::from_raw(0x0428_208B),
            Err(ErrorKind::ReservedBits(0x0428_208B))
        );
        assert_eq!(
            SimpleCanId::from_raw(0x0444_008B),
            Err(ErrorKind::ReservedBits(0x0444_008B))
        );
    }

    #[test]
    fn frame_limits() {
        assert_eq!(
            CanFrame::new_extended(0x2000_0000, &[]),
            Err(ErrorKind::IdOutOfRange(0x2000_0000))
        );
        assert_eq!(
            CanFrame::new_extended(1, &[0; 9]),
            Err(ErrorKind::BadLength(9))
        );
        assert_eq!(
            SimpleCanId::new(128, 5, 0),
            Err(ErrorKind::IdOutOfRange(128))
        );
        assert!(SimpleCanId::new(4, 5, 0)
            .unwrap()
            .with_fragment(FragmentTag { index: 16, more: false })
            .is_err());
    }
}
