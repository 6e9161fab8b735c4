//! MT frame structure and FCS handling

use crate::types::{CommandType, FramingError, ProtocolError, ProtocolViolation, Subsystem};

/// Start-of-frame marker
pub const SOF: u8 = 0xFE;

/// Maximum payload length carried by one frame
pub const MAX_PAYLOAD: usize = 250;

/// Minimum serialized size: SOF(1) + LEN(1) + CMD0(1) + CMD1(1) + FCS(1)
pub const MIN_FRAME_SIZE: usize = 5;

/// MT protocol frame
///
/// Wire format:
/// ```text
/// [SOF: 0xFE]
/// [Length: 1 byte] (payload bytes only)
/// [CMD0: 1 byte] (type << 5 | subsystem)
/// [CMD1: 1 byte] (command id)
/// [Payload: variable, 0..=250]
/// [FCS: 1 byte] (XOR of LEN through last payload byte)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtFrame {
    pub subsystem: Subsystem,
    pub cmd_type: CommandType,
    pub id: u8,
    pub payload: Vec<u8>,
}

impl MtFrame {
    #[must_use]
    pub fn new(subsystem: Subsystem, cmd_type: CommandType, id: u8, payload: Vec<u8>) -> Self {
        Self {
            subsystem,
            cmd_type,
            id,
            payload,
        }
    }

    /// CMD0 byte: frame type in the top 3 bits, subsystem in the low 5
    #[must_use]
    pub fn cmd0(&self) -> u8 {
        ((self.cmd_type as u8) << 5) | self.subsystem.bits()
    }

    /// Serialize to wire bytes
    #[must_use]
    #[allow(clippy::missing_panics_doc)] // Panic only on protocol-violating payload size
    pub fn serialize(&self) -> Vec<u8> {
        assert!(
            self.payload.len() <= MAX_PAYLOAD,
            "payload exceeds protocol maximum"
        );

        let mut data = Vec::with_capacity(self.payload.len() + MIN_FRAME_SIZE);
        data.push(SOF);
        data.push(self.payload.len() as u8);
        data.push(self.cmd0());
        data.push(self.id);
        data.extend_from_slice(&self.payload);

        // FCS covers LEN through the last payload byte
        let fcs = checksum(&data[1..]);
        data.push(fcs);
        data
    }

    /// Deserialize a complete wire frame (SOF through FCS)
    #[allow(clippy::missing_errors_doc)]
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < MIN_FRAME_SIZE {
            return Err(FramingError::Truncated(data.len()).into());
        }
        if data[0] != SOF {
            return Err(FramingError::Truncated(data.len()).into());
        }

        let len = data[1] as usize;
        if len > MAX_PAYLOAD {
            return Err(FramingError::BadLength(len).into());
        }
        if data.len() != MIN_FRAME_SIZE + len {
            return Err(FramingError::Truncated(data.len()).into());
        }

        let fcs_offset = data.len() - 1;
        let expected = checksum(&data[1..fcs_offset]);
        let actual = data[fcs_offset];
        if expected != actual {
            return Err(FramingError::BadFcs { expected, actual }.into());
        }

        let cmd0 = data[2];
        let cmd_type = CommandType::from_bits(cmd0 >> 5).ok_or(
            ProtocolViolation::UnknownCommand {
                cmd0,
                cmd1: data[3],
            },
        )?;
        let subsystem = Subsystem::from_bits(cmd0 & 0x1F);

        Ok(Self {
            subsystem,
            cmd_type,
            id: data[3],
            payload: data[4..fcs_offset].to_vec(),
        })
    }
}

/// XOR checksum over LEN, CMD0, CMD1 and payload bytes
#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}
