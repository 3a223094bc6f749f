//! Streaming UIMessage codec for `tokio_util::codec::Framed`

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ErrorKind;
use crate::uimessage::{Decoded, UiMessage};

/// One item read from a UIMessage stream.
///
/// Malformed input is surfaced as an item rather than a stream error so the
/// reader can report it and keep going after resynchronizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(UiMessage),
    Malformed(ErrorKind),
}

/// Codec framing UIMessages on a byte stream
#[derive(Debug, Default, Clone, Copy)]
pub struct UiMessageCodec;

impl UiMessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for UiMessageCodec {
    type Item = Inbound;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match UiMessage::decode(src) {
            Decoded::Message(msg, consumed) => {
                src.advance(consumed);
                Ok(Some(Inbound::Message(msg)))
            }
            Decoded::NeedMoreData => Ok(None),
            Decoded::Malformed { kind, consumed } => {
                tracing::debug!(%kind, consumed, "Discarding malformed input");
                src.advance(consumed);
                Ok(Some(Inbound::Malformed(kind)))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !buf.is_empty() {
                    tracing::debug!(leftover = buf.len(), "Dropping truncated message at EOF");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<UiMessage> for UiMessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: UiMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Encoder<&UiMessage> for UiMessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &UiMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn model_request() -> UiMessage {
        UiMessage::new(2, 0x0B, Bytes::new()).unwrap().with_ack(true)
    }

    #[test]
    fn retains_partial_message_across_reads() {
        let mut codec = UiMessageCodec::new();
        let bytes = model_request().to_bytes();

        let mut buf = BytesMut::from(&bytes[..10]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&bytes[10..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Message(model_request()))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_messages() {
        let mut codec = UiMessageCodec::new();
        let first = model_request();
        let second = UiMessage::new(6, 0x0C, Bytes::new()).unwrap().with_sequence_tag(3);

        let mut buf = BytesMut::new();
        codec.encode(&first, &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Message(first)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Message(second)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn reports_malformed_then_recovers() {
        let mut codec = UiMessageCodec::new();
        let mut buf = BytesMut::from(&[0x01, 0x02][..]);
        buf.extend_from_slice(&model_request().to_bytes());

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Malformed(ErrorKind::BadStartOfMessage(0x01)))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Message(model_request()))
        );
    }

    #[test]
    fn checksum_failure_skips_whole_message() {
        let mut codec = UiMessageCodec::new();
        let mut corrupted = model_request().to_bytes().to_vec();
        corrupted[5] ^= 0x01;

        let mut buf = BytesMut::from(corrupted.as_slice());
        buf.extend_from_slice(&model_request().to_bytes());

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Malformed(ErrorKind::ChecksumMismatch { .. }))
        ));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Message(model_request()))
        );
    }

    #[test]
    fn corrupted_length_does_not_stall_following_messages() {
        let mut codec = UiMessageCodec::new();
        let mut corrupted = model_request().to_bytes().to_vec();
        corrupted[3] = 0x40;

        let mut buf = BytesMut::from(corrupted.as_slice());
        for _ in 0..3 {
            buf.extend_from_slice(&model_request().to_bytes());
        }

        let mut items = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            items.push(item);
        }
        assert!(buf.is_empty());
        assert_eq!(items[0], Inbound::Malformed(ErrorKind::BadLength(0x40)));
        assert_eq!(items[1], Inbound::Malformed(ErrorKind::BadStartOfMessage(0x02)));
        assert_eq!(
            items[items.len() - 3..],
            [
                Inbound::Message(model_request()),
                Inbound::Message(model_request()),
                Inbound::Message(model_request()),
            ]
        );
    }

    #[test]
    fn extended_message_split_mid_payload_still_waits() {
        let mut codec = UiMessageCodec::new();
        let msg = UiMessage::new(5, 0x30, vec![0x11; 20]).unwrap();
        let bytes = msg.to_bytes();

        let mut buf = BytesMut::from(&bytes[..16]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&bytes[16..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Message(msg)));
    }

    #[test]
    fn truncated_tail_is_dropped_at_eof() {
        let mut codec = UiMessageCodec::new();
        let bytes = model_request().to_bytes();
        let mut buf = BytesMut::from(&bytes[..7]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }
}
