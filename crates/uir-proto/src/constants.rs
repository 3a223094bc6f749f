//! Constants used by UIM342 motors and UIROBOT CAN gateways
//!
//! Only the subset needed to run a gateway is defined here; motor command
//! function codes are forwarded untouched and have no constants.

/// Function codes (control word with the ACK bit masked off)
pub mod function_code {
    pub const PROTOCOL_PARAMETER: u8 = 0x01;
    /// Undocumented, sent by StepEva-3 with data `0A 00`
    pub const WAKE_NODE: u8 = 0x06;
    pub const MODEL: u8 = 0x0B;
    pub const SERIAL_NUMBER: u8 = 0x0C;
    pub const ERROR_REPORT: u8 = 0x0F;
}

/// Control word bit requesting an acknowledgement
pub const ACK_BIT: u8 = 0x80;

/// Mask for the function code part of a control word
pub const FUNCTION_CODE_MASK: u8 = 0x7F;

/// Reserved node IDs (<= 4) for controllers and gateways
pub mod node_id {
    /// Global group address, every node listens on it
    pub const GLOBAL: u8 = 0;
    pub const UIM2523: u8 = 2;
    pub const UIM2513: u8 = 3;
    /// The "user master controller" talking CAN directly
    pub const MASTER: u8 = 4;
    /// Highest reserved node ID
    pub const RESERVED_MAX: u8 = 4;
    /// Highest node ID representable in a SimpleCAN identifier (7 bits)
    pub const MAX: u8 = 0x7F;
}

/// Protocol parameter indices (function code PROTOCOL_PARAMETER, data[0])
pub mod protocol_parameter {
    pub const RS232_BAUD: u8 = 1;
    pub const CAN_BITRATE: u8 = 5;
    pub const NODE_ID: u8 = 7;
}

/// Gateway and controller model numbers as reported by MODEL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayModel {
    Uim2513,
    Uim2522,
    Uim2523,
    /// MMC901S, MMC901M, MMC902S, ...
    Mmc90x,
}

impl GatewayModel {
    pub fn bytes(&self) -> [u8; 2] {
        match self {
            GatewayModel::Uim2513 => [0x19, 0x0D],
            GatewayModel::Uim2522 => [0x19, 0x16],
            GatewayModel::Uim2523 => [0x19, 0x17],
            GatewayModel::Mmc90x => [0x5A, 0x00],
        }
    }

    /// Default node ID documented for the model
    pub fn default_node_id(&self) -> u8 {
        match self {
            GatewayModel::Uim2513 => node_id::UIM2513,
            _ => node_id::UIM2523,
        }
    }
}

impl std::str::FromStr for GatewayModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uim2513" => Ok(GatewayModel::Uim2513),
            "uim2522" => Ok(GatewayModel::Uim2522),
            "uim2523" => Ok(GatewayModel::Uim2523),
            "mmc90x" => Ok(GatewayModel::Mmc90x),
            other => Err(format!("unknown gateway model '{}'", other)),
        }
    }
}

/// Model bytes reported by a UIM342 stepper controller.
///
/// Model numbers are packed as two decimal digit pairs, e.g. UIM2523 is
/// `[25, 23]`.
pub const UIM342_MODEL: [u8; 2] = [3, 42];

/// Firmware version reported in MODEL replies
pub const FIRMWARE_VERSION: [u8; 2] = [0x69, 0x7A];

/// RS-232 baud codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Rs232Baud {
    Baud4800 = 0,
    Baud9600 = 1,
    Baud19200 = 2,
    Baud38400 = 3,
    Baud57600 = 4,
    Baud115200 = 5,
}

impl Rs232Baud {
    const ALL: [Rs232Baud; 6] = [
        Rs232Baud::Baud4800,
        Rs232Baud::Baud9600,
        Rs232Baud::Baud19200,
        Rs232Baud::Baud38400,
        Rs232Baud::Baud57600,
        Rs232Baud::Baud115200,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn from_baud(baud: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.baud() == baud)
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn baud(&self) -> u32 {
        match self {
            Rs232Baud::Baud4800 => 4800,
            Rs232Baud::Baud9600 => 9600,
            Rs232Baud::Baud19200 => 19200,
            Rs232Baud::Baud38400 => 38400,
            Rs232Baud::Baud57600 => 57600,
            Rs232Baud::Baud115200 => 115200,
        }
    }
}

/// CAN bitrate codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CanBitrate {
    Kbps1000 = 0,
    Kbps800 = 1,
    Kbps500 = 2,
    Kbps250 = 3,
    Kbps125 = 4,
}

impl CanBitrate {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CanBitrate::Kbps1000),
            1 => Some(CanBitrate::Kbps800),
            2 => Some(CanBitrate::Kbps500),
            3 => Some(CanBitrate::Kbps250),
            4 => Some(CanBitrate::Kbps125),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn bits_per_second(&self) -> u32 {
        match self {
            CanBitrate::Kbps1000 => 1_000_000,
            CanBitrate::Kbps800 => 800_000,
            CanBitrate::Kbps500 => 500_000,
            CanBitrate::Kbps250 => 250_000,
            CanBitrate::Kbps125 => 125_000,
        }
    }
}

impl std::str::FromStr for CanBitrate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1000k" | "1m" | "1000000" => Ok(CanBitrate::Kbps1000),
            "800k" | "800000" => Ok(CanBitrate::Kbps800),
            "500k" | "500000" => Ok(CanBitrate::Kbps500),
            "250k" | "250000" => Ok(CanBitrate::Kbps250),
            "125k" | "125000" => Ok(CanBitrate::Kbps125),
            other => Err(format!("unsupported CAN bitrate '{}'", other)),
        }
    }
}

impl std::fmt::Display for CanBitrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}k", self.bits_per_second() / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_codes_and_names() {
        let rate: CanBitrate = "500k".parse().unwrap();
        assert_eq!(rate.code(), 2);
        assert_eq!(CanBitrate::from_code(2), Some(rate));
        assert_eq!(rate.to_string(), "500k");
        assert_eq!(CanBitrate::from_code(5), None);
        assert!("42k".parse::<CanBitrate>().is_err());
    }

    #[test]
    fn rs232_baud_lookup() {
        assert_eq!(Rs232Baud::from_baud(115200), Some(Rs232Baud::Baud115200));
        assert_eq!(Rs232Baud::Baud115200.code(), 5);
        assert_eq!(Rs232Baud::from_code(1), Some(Rs232Baud::Baud9600));
        assert_eq!(Rs232Baud::from_baud(300), None);
    }

    #[test]
    fn gateway_model_bytes_are_digit_pairs() {
        let model: GatewayModel = "UIM2523".parse().unwrap();
        assert_eq!(model.bytes(), [25, 23]);
        assert_eq!(model.default_node_id(), node_id::UIM2523);
        assert_eq!(GatewayModel::Uim2513.default_node_id(), node_id::UIM2513);
    }
}
