//! The gateway's own device
//!
//! Messages addressed to the gateway node ID, its group ID or the global
//! group never reach the bus. They are answered here the way a UIM2523 answers them, so client software can
//! discover and configure the gateway before talking to motors.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use uir_proto::constants::{
    function_code, node_id, protocol_parameter, CanBitrate, GatewayModel, Rs232Baud, FIRMWARE_VERSION,
};
use uir_proto::UiMessage;

use crate::config::{ConfigError, GatewayConfig};
use crate::error::BridgeError;

#[derive(Debug, Clone)]
struct DeviceState {
    serial_number: u32,
    manufacturer_id: u16,
    vendor_id: u16,
    can_bitrate: CanBitrate,
    rs232_baud: Rs232Baud,
}

/// Emulated gateway answering MODEL, SERIAL_NUMBER and PROTOCOL_PARAMETER
#[derive(Debug)]
pub struct GatewayDevice {
    node_id: u8,
    group_id: u8,
    model: GatewayModel,
    state: RwLock<DeviceState>,
}

impl GatewayDevice {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            node_id: config.resolved_node_id()?,
            group_id: config.resolved_group_id()?,
            model: config.parsed_model()?,
            state: RwLock::new(DeviceState {
                serial_number: config.serial_number,
                manufacturer_id: config.manufacturer_id,
                vendor_id: config.vendor_id,
                can_bitrate: config.parsed_can_bitrate()?,
                rs232_baud: config.parsed_rs232_baud()?,
            }),
        })
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Whether a message with this device ID is for the gateway itself
    pub fn answers(&self, device_id: u8) -> bool {
        device_id == node_id::GLOBAL || device_id == self.node_id || device_id == self.group_id
    }

    pub fn serial_number(&self) -> u32 {
        self.state.read().serial_number
    }

    pub fn can_bitrate(&self) -> CanBitrate {
        self.state.read().can_bitrate
    }

    /// Handle a message addressed to the gateway.
    ///
    /// `Ok(None)` means the message is accepted without a reply.
    pub fn handle(&self, msg: &UiMessage) -> Result<Option<UiMessage>, BridgeError> {
        let data = match msg.function_code() {
            function_code::MODEL if msg.need_ack() => self.model_record(),
            function_code::MODEL => return Ok(None),
            function_code::SERIAL_NUMBER => self.serial_number_request(msg)?,
            function_code::PROTOCOL_PARAMETER => self.protocol_parameter(msg)?,
            function_code::WAKE_NODE => {
                tracing::debug!(data = %hex::encode(msg.data()), "Wake node");
                return Ok(None);
            }
            other => {
                return Err(BridgeError::UnknownCommand {
                    device_id: msg.device_id(),
                    function_code: other,
                })
            }
        };

        let reply = UiMessage::new(self.node_id, msg.function_code(), data)?
            .with_sequence_tag(msg.sequence_tag());
        Ok(Some(reply))
    }

    fn model_record(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_slice(&self.model.bytes());
        buf.put_bytes(0, 2);
        buf.put_slice(&FIRMWARE_VERSION);
        buf.put_bytes(0, 2);
        buf.freeze()
    }

    fn serial_number_request(&self, msg: &UiMessage) -> Result<Bytes, BridgeError> {
        if !msg.need_ack() {
            let data: [u8; 4] = msg.data()[..]
                .try_into()
                .map_err(|_| uir_proto::ErrorKind::BadLength(msg.data().len()))?;
            let serial_number = u32::from_le_bytes(data);
            tracing::info!(serial_number, "Gateway serial number set");
            self.state.write().serial_number = serial_number;
        }

        let state = self.state.read();
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32_le(state.serial_number);
        buf.put_u16_le(state.manufacturer_id);
        buf.put_u16_le(state.vendor_id);
        Ok(buf.freeze())
    }

    fn protocol_parameter(&self, msg: &UiMessage) -> Result<Bytes, BridgeError> {
        let Some((&index, value)) = msg.data().split_first() else {
            return Err(uir_proto::ErrorKind::BadLength(0).into());
        };
        let new_value = value.first().copied();

        let current = match index {
            protocol_parameter::CAN_BITRATE => {
                if let Some(code) = new_value {
                    let bitrate = CanBitrate::from_code(code)
                        .ok_or(BridgeError::InvalidParameter { index, value: code })?;
                    tracing::info!(%bitrate, "Gateway CAN bitrate set");
                    self.state.write().can_bitrate = bitrate;
                }
                self.state.read().can_bitrate.code()
            }
            protocol_parameter::RS232_BAUD => {
                if let Some(code) = new_value {
                    let baud = Rs232Baud::from_code(code)
                        .ok_or(BridgeError::InvalidParameter { index, value: code })?;
                    tracing::info!(baud = baud.baud(), "Gateway RS-232 baud set");
                    self.state.write().rs232_baud = baud;
                }
                self.state.read().rs232_baud.code()
            }
            protocol_parameter::NODE_ID => {
                if let Some(code) = new_value.filter(|&id| id != self.node_id) {
                    return Err(BridgeError::InvalidParameter { index, value: code });
                }
                self.node_id
            }
            _ => {
                return Err(BridgeError::UnknownCommand {
                    device_id: msg.device_id(),
                    function_code: msg.function_code(),
                })
            }
        };

        Ok(Bytes::copy_from_slice(&[index, current]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn device() -> GatewayDevice {
        GatewayDevice::from_config(&GatewayConfig::default()).unwrap()
    }

    fn request(function_code: u8, ack: bool, data: &[u8]) -> UiMessage {
        UiMessage::new(2, function_code, Bytes::copy_from_slice(data))
            .unwrap()
            .with_ack(ack)
            .with_sequence_tag(0x2A)
    }

    #[test]
    fn answers_own_group_and_global_ids() {
        let device = device();
        assert!(device.answers(0));
        assert!(device.answers(2));
        assert!(!device.answers(5));

        let grouped = GatewayDevice::from_config(&GatewayConfig {
            group_id: Some(10),
            ..Default::default()
        })
        .unwrap();
        assert!(grouped.answers(10));
        assert!(grouped.answers(2));

        let reply = grouped
            .handle(&UiMessage::new(10, function_code::MODEL, Bytes::new()).unwrap().with_ack(true))
            .unwrap()
            .unwrap();
        assert_eq!(reply.device_id(), 2);
    }

    #[test]
    fn model_reply_matches_vendor_bytes() {
        let reply = device()
            .handle(&request(function_code::MODEL, true, &[]))
            .unwrap()
            .unwrap();
        assert_eq!(
            hex::encode(reply.with_sequence_tag(0).to_bytes()),
            "aa020b0819170000697a0000009b60cc"
        );
    }

    #[test]
    fn reply_echoes_sequence_tag() {
        let reply = device()
            .handle(&request(function_code::SERIAL_NUMBER, true, &[]))
            .unwrap()
            .unwrap();
        assert_eq!(reply.sequence_tag(), 0x2A);
        assert_eq!(
            reply.data().as_ref(),
            &[0xD9, 0x29, 0x95, 0x49, 0x41, 0x41, 0x42, 0x42]
        );
    }

    #[test]
    fn serial_number_can_be_set() {
        let device = device();
        let reply = device
            .handle(&request(function_code::SERIAL_NUMBER, false, &[1, 0, 0, 0]))
            .unwrap()
            .unwrap();
        assert_eq!(device.serial_number(), 1);
        assert_eq!(&reply.data()[..4], &[1, 0, 0, 0]);

        assert!(matches!(
            device.handle(&request(function_code::SERIAL_NUMBER, false, &[1, 2])),
            Err(BridgeError::Malformed(_))
        ));
    }

    #[test]
    fn can_bitrate_get_and_set() {
        let device = device();
        let get = request(function_code::PROTOCOL_PARAMETER, true, &[5]);
        let reply = device.handle(&get).unwrap().unwrap();
        assert_eq!(reply.data().as_ref(), &[5, 2]);

        let set = request(function_code::PROTOCOL_PARAMETER, true, &[5, 3]);
        let reply = device.handle(&set).unwrap().unwrap();
        assert_eq!(reply.data().as_ref(), &[5, 3]);
        assert_eq!(device.can_bitrate(), CanBitrate::Kbps250);

        let bad = request(function_code::PROTOCOL_PARAMETER, true, &[5, 9]);
        assert_eq!(
            device.handle(&bad),
            Err(BridgeError::InvalidParameter { index: 5, value: 9 })
        );
    }

    #[test]
    fn node_id_and_baud_are_reported() {
        let device = device();
        let reply = device
            .handle(&request(function_code::PROTOCOL_PARAMETER, true, &[7]))
            .unwrap()
            .unwrap();
        assert_eq!(reply.data().as_ref(), &[7, 2]);

        let reply = device
            .handle(&request(function_code::PROTOCOL_PARAMETER, true, &[1]))
            .unwrap()
            .unwrap();
        assert_eq!(reply.data().as_ref(), &[1, 5]);
    }

    #[test]
    fn unsupported_commands_are_rejected() {
        let device = device();
        assert_eq!(
            device.handle(&request(0x30, true, &[])),
            Err(BridgeError::UnknownCommand {
                device_id: 2,
                function_code: 0x30
            })
        );
        assert!(matches!(
            device.handle(&request(function_code::PROTOCOL_PARAMETER, true, &[42])),
            Err(BridgeError::UnknownCommand { .. })
        ));
        assert_eq!(device.handle(&request(function_code::WAKE_NODE, false, &[0x0A, 0])), Ok(None));
    }
}
