//! Common types used throughout the MT protocol

use thiserror::Error;

/// MT subsystem, the 5-bit field of CMD0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// RPC error replies from the firmware
    RpcError,
    Sys,
    Mac,
    Nwk,
    Af,
    Zdo,
    Sapi,
    Util,
    Debug,
    App,
    Znp,
    Ubl,
    AppCnf,
    GreenPower,
    /// Subsystem value the catalogue does not know
    Other(u8),
}

impl Subsystem {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x1F {
            0x00 => Subsystem::RpcError,
            0x01 => Subsystem::Sys,
            0x02 => Subsystem::Mac,
            0x03 => Subsystem::Nwk,
            0x04 => Subsystem::Af,
            0x05 => Subsystem::Zdo,
            0x06 => Subsystem::Sapi,
            0x07 => Subsystem::Util,
            0x08 => Subsystem::Debug,
            0x09 => Subsystem::App,
            0x0B => Subsystem::Znp,
            0x0D => Subsystem::Ubl,
            0x0F => Subsystem::AppCnf,
            0x15 => Subsystem::GreenPower,
            v => Subsystem::Other(v),
        }
    }

    #[must_use]
    pub fn bits(&self) -> u8 {
        match self {
            Subsystem::RpcError => 0x00,
            Subsystem::Sys => 0x01,
            Subsystem::Mac => 0x02,
            Subsystem::Nwk => 0x03,
            Subsystem::Af => 0x04,
            Subsystem::Zdo => 0x05,
            Subsystem::Sapi => 0x06,
            Subsystem::Util => 0x07,
            Subsystem::Debug => 0x08,
            Subsystem::App => 0x09,
            Subsystem::Znp => 0x0B,
            Subsystem::Ubl => 0x0D,
            Subsystem::AppCnf => 0x0F,
            Subsystem::GreenPower => 0x15,
            Subsystem::Other(v) => v & 0x1F,
        }
    }
}

/// MT frame type, the 3-bit field of CMD0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    /// Polling read (bare-MCU transports only)
    Poll = 0,
    /// Synchronous request
    Sreq = 1,
    /// Asynchronous request or indication
    Areq = 2,
    /// Synchronous response
    Srsp = 3,
}

impl CommandType {
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x07 {
            0 => Some(CommandType::Poll),
            1 => Some(CommandType::Sreq),
            2 => Some(CommandType::Areq),
            3 => Some(CommandType::Srsp),
            _ => None,
        }
    }
}

/// Status byte returned by the firmware in SRSPs and confirms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZnpStatus {
    Success,
    Failure,
    InvalidParameter,
    NvItemUninit,
    NvOperFailed,
    NvBadItemLen,
    MemError,
    BufferFull,
    UnsupportedMode,
    MacMemError,
    NotAuthorized,
    ApsFail,
    ApsTableFull,
    ApsIllegalRequest,
    ApsInvalidBinding,
    ApsNotSupported,
    ApsNoAck,
    ApsDuplicateEntry,
    ApsNoBoundDevice,
    NwkInvalidParam,
    NwkInvalidRequest,
    NwkNotPermitted,
    NwkStartupFailure,
    NwkTableFull,
    NwkUnknownDevice,
    NwkNoNetworks,
    NwkNoAck,
    NwkNoRoute,
    MacChannelAccessFailure,
    MacNoAck,
    MacNoBeacon,
    MacTransactionExpired,
    MacTransactionOverflow,
    Other(u8),
}

impl ZnpStatus {
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => ZnpStatus::Success,
            0x01 => ZnpStatus::Failure,
            0x02 => ZnpStatus::InvalidParameter,
            0x09 => ZnpStatus::NvItemUninit,
            0x0A => ZnpStatus::NvOperFailed,
            0x0C => ZnpStatus::NvBadItemLen,
            0x10 => ZnpStatus::MemError,
            0x11 => ZnpStatus::BufferFull,
            0x12 => ZnpStatus::UnsupportedMode,
            0x13 => ZnpStatus::MacMemError,
            0x7E => ZnpStatus::NotAuthorized,
            0xB1 => ZnpStatus::ApsFail,
            0xB2 => ZnpStatus::ApsTableFull,
            0xB3 => ZnpStatus::ApsIllegalRequest,
            0xB4 => ZnpStatus::ApsInvalidBinding,
            0xB6 => ZnpStatus::ApsNotSupported,
            0xB7 => ZnpStatus::ApsNoAck,
            0xB8 => ZnpStatus::ApsDuplicateEntry,
            0xB9 => ZnpStatus::ApsNoBoundDevice,
            0xC1 => ZnpStatus::NwkInvalidParam,
            0xC2 => ZnpStatus::NwkInvalidRequest,
            0xC3 => ZnpStatus::NwkNotPermitted,
            0xC4 => ZnpStatus::NwkStartupFailure,
            0xC7 => ZnpStatus::NwkTableFull,
            0xC8 => ZnpStatus::NwkUnknownDevice,
            0xCA => ZnpStatus::NwkNoNetworks,
            0xCC => ZnpStatus::NwkNoAck,
            0xCD => ZnpStatus::NwkNoRoute,
            0xE1 => ZnpStatus::MacChannelAccessFailure,
            0xE9 => ZnpStatus::MacNoAck,
            0xEA => ZnpStatus::MacNoBeacon,
            0xF0 => ZnpStatus::MacTransactionExpired,
            0xF1 => ZnpStatus::MacTransactionOverflow,
            v => ZnpStatus::Other(v),
        }
    }

    #[must_use]
    pub fn as_byte(&self) -> u8 {
        match self {
            ZnpStatus::Success => 0x00,
            ZnpStatus::Failure => 0x01,
            ZnpStatus::InvalidParameter => 0x02,
            ZnpStatus::NvItemUninit => 0x09,
            ZnpStatus::NvOperFailed => 0x0A,
            ZnpStatus::NvBadItemLen => 0x0C,
            ZnpStatus::MemError => 0x10,
            ZnpStatus::BufferFull => 0x11,
            ZnpStatus::UnsupportedMode => 0x12,
            ZnpStatus::MacMemError => 0x13,
            ZnpStatus::NotAuthorized => 0x7E,
            ZnpStatus::ApsFail => 0xB1,
            ZnpStatus::ApsTableFull => 0xB2,
            ZnpStatus::ApsIllegalRequest => 0xB3,
            ZnpStatus::ApsInvalidBinding => 0xB4,
            ZnpStatus::ApsNotSupported => 0xB6,
            ZnpStatus::ApsNoAck => 0xB7,
            ZnpStatus::ApsDuplicateEntry => 0xB8,
            ZnpStatus::ApsNoBoundDevice => 0xB9,
            ZnpStatus::NwkInvalidParam => 0xC1,
            ZnpStatus::NwkInvalidRequest => 0xC2,
            ZnpStatus::NwkNotPermitted => 0xC3,
            ZnpStatus::NwkStartupFailure => 0xC4,
            ZnpStatus::NwkTableFull => 0xC7,
            ZnpStatus::NwkUnknownDevice => 0xC8,
            ZnpStatus::NwkNoNetworks => 0xCA,
            ZnpStatus::NwkNoAck => 0xCC,
            ZnpStatus::NwkNoRoute => 0xCD,
            ZnpStatus::MacChannelAccessFailure => 0xE1,
            ZnpStatus::MacNoAck => 0xE9,
            ZnpStatus::MacNoBeacon => 0xEA,
            ZnpStatus::MacTransactionExpired => 0xF0,
            ZnpStatus::MacTransactionOverflow => 0xF1,
            ZnpStatus::Other(v) => *v,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ZnpStatus::Success)
    }
}

/// IEEE (EUI-64) address, little-endian on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IeeeAddr(pub u64);

impl IeeeAddr {
    /// Parse from 8 little-endian bytes
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl std::fmt::Display for IeeeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Stored little-endian, displayed big-endian
        let bytes = self.0.to_le_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[7], bytes[6], bytes[5], bytes[4], bytes[3], bytes[2], bytes[1], bytes[0]
        )
    }
}

/// 16-bit network (short) address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NwkAddr(pub u16);

impl std::fmt::Display for NwkAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Framing-level errors detected by the codec
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("bad FCS: expected {expected:#04x}, got {actual:#04x}")]
    BadFcs { expected: u8, actual: u8 },

    #[error("bad frame length: {0}")]
    BadLength(usize),

    #[error("truncated frame: {0} bytes")]
    Truncated(usize),
}

/// Protocol-level violations (firmware misbehaviour, never fatal to the bus)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("unexpected SRSP {subsystem:?}/{id:#04x}")]
    UnexpectedSrsp { subsystem: Subsystem, id: u8 },

    #[error("unknown command CMD0={cmd0:#04x} CMD1={cmd1:#04x}")]
    UnknownCommand { cmd0: u8, cmd1: u8 },

    #[error("failed to decode {command} from payload {payload}")]
    FieldDecode {
        command: &'static str,
        payload: String,
    },
}

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("serial port error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("request timeout")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("transport disconnected")]
    Disconnected,

    #[error("{command} failed with firmware status {status:?}")]
    CommandStatus {
        command: &'static str,
        status: ZnpStatus,
    },
}
