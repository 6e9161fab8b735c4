//! Coordinator-level error types

use thiserror::Error;
use znp_protocol::types::ProtocolError;

/// Why a backup document was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("backup was taken from an incompatible chip: {0}")]
    IncompatibleChip(String),
}

/// Failures of the serial-bootloader handshake
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderError {
    #[error("firmware image CRC mismatch")]
    Crc,

    #[error("unexpected bootloader sequence")]
    Sequence,

    #[error("bootloader handshake timed out")]
    Timeout,
}

/// Errors surfaced by the coordinator driver
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid driver state: expected {expected}, currently {actual}")]
    State {
        expected: &'static str,
        actual: String,
    },

    #[error("NVRAM item {0} is missing")]
    NvramMissing(&'static str),

    #[error("NVRAM item {0} did not verify after restore")]
    NvramMismatch(&'static str),

    #[error("backup rejected: {0}")]
    Backup(#[from] BackupError),

    #[error("bootloader error: {0}")]
    Bootloader(#[from] BootloaderError),
}
