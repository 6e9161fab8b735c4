//! Zigbee coordinator driver for TI ZNP coprocessors
//!
//! This crate builds the coordinator lifecycle on top of the MT protocol
//! layer: NVRAM management, network formation and restore, the device
//! table, application data requests with confirmation matching, and the
//! backup file format.

pub mod backup;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod nvram;
pub mod version;

#[cfg(test)]
pub(crate) mod sim;

pub use backup::BackupDocument;
pub use config::{DriverConfig, LedMode};
pub use coordinator::{
    BroadcastDst, Destination, Driver, DriverState, EndpointConfig, FormConfig, IncomingMessage,
    NetworkInfo, StartMode, TxOptions, ZnpEvent,
};
pub use device::{DeviceEntry, DeviceTable, Relationship};
pub use error::{BackupError, BootloaderError, CoordinatorError};
pub use nvram::{NvramManager, NvramSnapshot, ResetDepth};
pub use version::{FirmwareVersion, ZStackFlavor};
