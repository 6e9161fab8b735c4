//! MT serial protocol implementation for TI ZNP coprocessors
//!
//! This crate implements the Monitor-and-Test protocol spoken by Z-Stack
//! firmware on CC2531/CC2652/CC1352 Zigbee Network Processors: frame
//! codec, typed command catalogue, serial transport and the command
//! multiplexer the coordinator layer is built on.

pub mod bus;
pub mod cmd;
pub mod codec;
pub mod frame;
pub mod transport;
pub mod types;

pub use bus::{
    BusOptions, BusStats, MtBus, TypedSubscription, DEFAULT_ARSP_TIMEOUT, DEFAULT_SREQ_TIMEOUT,
};
pub use codec::{DecoderStats, FrameDecoder};
pub use frame::{MtFrame, MAX_PAYLOAD, SOF};
pub use transport::{connect, MtLink, MtLinkPeer, SerialConfig, WriteCommand, BAUD_RATE};
pub use types::*;
