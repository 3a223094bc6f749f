//! UIMessage to SimpleCAN translation
//!
//! Outbound, a request becomes one or more CAN frames addressed to the
//! mapped node plus the key its reply will arrive under. Inbound, a
//! reassembled reply becomes a UIMessage from the node's logical address
//! carrying the request's sequence tag.

use std::sync::Arc;

use uir_proto::constants::node_id;
use uir_proto::{
    CanFrame, FragmentTag, ReplyKey, SimpleCanFrame, SimpleCanId, UiMessage, CAN_MAX_DLEN,
    MAX_FRAGMENTS,
};

use crate::error::BridgeError;
use crate::reassembly::CompletedReply;
use crate::router::AddressMap;

/// Frames for one request and the reply they expect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub frames: Vec<CanFrame>,
    /// Set when the request asked for an acknowledgement
    pub expect: Option<ReplyKey>,
}

/// Translates between the two framings for one address map
#[derive(Debug, Clone)]
pub struct Translator {
    router: Arc<AddressMap>,
}

impl Translator {
    pub fn new(router: Arc<AddressMap>) -> Self {
        Self { router }
    }

    /// Translate a client request into CAN frames.
    ///
    /// Every node on the global group answers under its own node ID, so
    /// a request to it may not ask for an acknowledgement.
    pub fn outbound(&self, msg: &UiMessage) -> Result<OutboundRequest, BridgeError> {
        let base = self
            .router
            .base_id(msg.device_id())?
            .with_control_word(msg.control_word());
        if msg.need_ack() && base.consumer() == node_id::GLOBAL {
            return Err(BridgeError::BroadcastAck(msg.device_id()));
        }
        let frames = fragment_payload(base, msg.data())?;

        let expect = msg.need_ack().then(|| ReplyKey {
            node: base.consumer(),
            function_code: msg.function_code(),
        });

        Ok(OutboundRequest { frames, expect })
    }

    /// Translate a reassembled reply back into a UIMessage
    pub fn inbound(
        &self,
        reply: &CompletedReply,
        sequence_tag: u8,
    ) -> Result<UiMessage, BridgeError> {
        let address = self.router.address_of(reply.key.node)?;
        let msg = UiMessage::from_control_word(address, reply.control_word, reply.data.clone())?
            .with_sequence_tag(sequence_tag);
        Ok(msg)
    }
}

/// Split a payload into frames under `base`, tagging each with its index.
///
/// An empty payload still yields one empty frame.
pub fn fragment_payload(base: SimpleCanId, payload: &[u8]) -> Result<Vec<CanFrame>, BridgeError> {
    if payload.is_empty() {
        let id = base.with_fragment(FragmentTag::SINGLE)?;
        return Ok(vec![SimpleCanFrame::new(id, &[])?.encode()]);
    }

    let count = payload.len().div_ceil(CAN_MAX_DLEN);
    if count > MAX_FRAGMENTS {
        return Err(uir_proto::ErrorKind::BadLength(payload.len()).into());
    }

    payload
        .chunks(CAN_MAX_DLEN)
        .enumerate()
        .map(|(index, chunk)| -> Result<CanFrame, BridgeError> {
            let id = base.with_fragment(FragmentTag {
                index: index as u8,
                more: index + 1 < count,
            })?;
            Ok(SimpleCanFrame::new(id, chunk)?.encode())
        })
        .collect()
}
