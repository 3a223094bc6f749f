//! Simulated SimpleCAN node
//!
//! Behaves like a UIM342 controller for the commands a gateway client uses
//! during discovery, and echoes the payload of any other acknowledged
//! command so fragmented traffic can be exercised end to end.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::time::Instant;
use uir_proto::constants::{function_code, node_id, FIRMWARE_VERSION, UIM342_MODEL};
use uir_proto::{CanFrame, ReplyKey, Role, SimpleCanFrame, SimpleCanId};

use crate::config::SimNodeConfig;
use crate::reassembly::{Progress, ReassemblyContext};
use crate::translate::fragment_payload;

/// Time a partially received command is kept
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

const MANUFACTURER_ID: u16 = 0x4141;
const VENDOR_ID: u16 = 0x4242;

/// A node answering commands addressed to it or to the global group
#[derive(Debug)]
pub struct SimulatedNode {
    node_id: u8,
    serial_number: u32,
    partial: HashMap<ReplyKey, ReassemblyContext>,
}

impl SimulatedNode {
    pub fn new(config: &SimNodeConfig) -> Self {
        Self {
            node_id: config.node_id,
            serial_number: config.serial_number,
            partial: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Process one frame seen on the bus, returning the frames sent back
    pub fn handle(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        let Ok(frame) = SimpleCanFrame::decode(frame) else {
            return Vec::new();
        };
        let id = *frame.id();
        if id.role() != Role::Command
            || (id.consumer() != self.node_id && id.consumer() != node_id::GLOBAL)
        {
            return Vec::new();
        }

        let now = Instant::now();
        self.partial.retain(|_, ctx| !ctx.check_deadline(now));

        let key = id.reply_key();
        let ctx = self
            .partial
            .entry(key)
            .or_insert_with(|| ReassemblyContext::new(key, COMMAND_TIMEOUT));

        match ctx.accept(&frame) {
            Ok(Progress::Accumulating) => Vec::new(),
            Ok(Progress::Complete(command)) => {
                self.partial.remove(&key);
                self.respond(id.producer(), command.control_word, &command.data)
            }
            Err(e) => {
                tracing::debug!(node = self.node_id, error = %e, "Simulated node dropped command");
                self.partial.remove(&key);
                Vec::new()
            }
        }
    }

    fn respond(&self, producer: u8, control_word: u8, payload: &[u8]) -> Vec<CanFrame> {
        let reply = SimpleCanId::new(self.node_id, producer, control_word);
        let Ok(reply) = reply else {
            return Vec::new();
        };
        if !reply.need_ack() {
            return Vec::new();
        }
        let reply = reply.with_control_word(reply.function_code());

        let data = match reply.function_code() {
            function_code::MODEL => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_slice(&UIM342_MODEL);
                buf.put_bytes(0, 2);
                buf.put_slice(&FIRMWARE_VERSION);
                buf.put_bytes(0, 2);
                buf
            }
            function_code::SERIAL_NUMBER => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_u32_le(self.serial_number);
                buf.put_u16_le(MANUFACTURER_ID);
                buf.put_u16_le(VENDOR_ID);
                buf
            }
            _ => BytesMut::from(payload),
        };

        fragment_payload(reply, &data).unwrap_or_else(|e| {
            tracing::debug!(node = self.node_id, error = %e, "Simulated reply not encodable");
            Vec::new()
        })
    }
}
