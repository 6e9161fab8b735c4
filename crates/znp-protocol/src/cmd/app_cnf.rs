//! APP_CNF subsystem: Z-Stack 3.x Base Device Behaviour commissioning

use crate::cmd::{Indication, SyncRequest};

/// BDB commissioning modes for [`BdbStartCommissioning`]
pub mod commissioning_mode {
    pub const INITIALIZATION: u8 = 0x00;
    pub const TOUCHLINK: u8 = 0x01;
    pub const NETWORK_STEERING: u8 = 0x02;
    pub const NETWORK_FORMATION: u8 = 0x04;
    pub const FINDING_BINDING: u8 = 0x08;
}

znp_command! {
    pub struct BdbStartCommissioning: AppCnf/Sreq/0x05 {
        pub mode: u8,
    }
}

status_rsp! {
    pub struct BdbStartCommissioningRsp: AppCnf/0x05
}

impl SyncRequest for BdbStartCommissioning {
    type Response = BdbStartCommissioningRsp;
}

znp_command! {
    /// Select the primary or secondary BDB channel set
    pub struct BdbSetChannel: AppCnf/Sreq/0x08 {
        pub is_primary: bool,
        pub channel_mask: u32,
    }
}

status_rsp! {
    pub struct BdbSetChannelRsp: AppCnf/0x08
}

impl SyncRequest for BdbSetChannel {
    type Response = BdbSetChannelRsp;
}

znp_command! {
    pub struct BdbSetTcRequireKeyExchange: AppCnf/Sreq/0x09 {
        pub required: bool,
    }
}

status_rsp! {
    pub struct BdbSetTcRequireKeyExchangeRsp: AppCnf/0x09
}

impl SyncRequest for BdbSetTcRequireKeyExchange {
    type Response = BdbSetTcRequireKeyExchangeRsp;
}

znp_command! {
    /// Bump the outgoing NWK frame counter, required after key restore
    pub struct SetNwkFrameCounter: AppCnf/Sreq/0xFF {
        pub value: u32,
    }
}

status_rsp! {
    pub struct SetNwkFrameCounterRsp: AppCnf/0xFF
}

impl SyncRequest for SetNwkFrameCounter {
    type Response = SetNwkFrameCounterRsp;
}

znp_command! {
    pub struct BdbCommissioningNotification: AppCnf/Areq/0x80 {
        pub status: u8,
        pub mode: u8,
        pub remaining_modes: u8,
    }
}

impl Indication for BdbCommissioningNotification {}

/// Commissioning status codes carried by [`BdbCommissioningNotification`]
pub mod commissioning_status {
    pub const SUCCESS: u8 = 0x00;
    pub const IN_PROGRESS: u8 = 0x01;
    pub const NO_NETWORK: u8 = 0x02;
    pub const FORMATION_FAILURE: u8 = 0x04;
}
