//! SYS subsystem: device control, versioning and NV storage access

use crate::cmd::{AsyncRequest, Indication, LongBytes, SyncRequest};
use crate::types::{IeeeAddr, ZnpStatus};

/// Argument to [`ResetReq`]
pub const RESET_TYPE_HARD: u8 = 0x00;
pub const RESET_TYPE_SOFT: u8 = 0x01;

znp_command! {
    /// Capabilities probe; the bus watchdog reuses it as a liveness check
    pub struct Ping: Sys/Sreq/0x01 {}
}

znp_command! {
    pub struct PingRsp: Sys/Srsp/0x01 {
        pub capabilities: u16,
    }
}

impl SyncRequest for Ping {
    type Response = PingRsp;
}

znp_command! {
    pub struct Version: Sys/Sreq/0x02 {}
}

znp_command! {
    pub struct VersionRsp: Sys/Srsp/0x02 {
        pub transport_rev: u8,
        pub product: u8,
        pub major: u8,
        pub minor: u8,
        pub maint: u8,
        /// Build revision, present on Z-Stack 3.x images only
        pub revision: Option<u32>,
    }
}

impl SyncRequest for Version {
    type Response = VersionRsp;
}

znp_command! {
    /// Reset the device; answered by [`ResetInd`] once the stack is back up
    pub struct ResetReq: Sys/Areq/0x00 {
        pub reset_type: u8,
    }
}

impl AsyncRequest for ResetReq {}

znp_command! {
    pub struct ResetInd: Sys/Areq/0x80 {
        pub reason: u8,
        pub transport_rev: u8,
        pub product: u8,
        pub major: u8,
        pub minor: u8,
        pub maint: u8,
    }
}

impl Indication for ResetInd {}

znp_command! {
    pub struct SetExtAddr: Sys/Sreq/0x03 {
        pub ext_addr: IeeeAddr,
    }
}

status_rsp! {
    pub struct SetExtAddrRsp: Sys/0x03
}

impl SyncRequest for SetExtAddr {
    type Response = SetExtAddrRsp;
}

znp_command! {
    pub struct GetExtAddr: Sys/Sreq/0x04 {}
}

znp_command! {
    pub struct GetExtAddrRsp: Sys/Srsp/0x04 {
        pub ext_addr: IeeeAddr,
    }
}

impl SyncRequest for GetExtAddr {
    type Response = GetExtAddrRsp;
}

znp_command! {
    pub struct Random: Sys/Sreq/0x0C {}
}

znp_command! {
    pub struct RandomRsp: Sys/Srsp/0x0C {
        pub value: u16,
    }
}

impl SyncRequest for Random {
    type Response = RandomRsp;
}

znp_command! {
    pub struct SetTxPower: Sys/Sreq/0x14 {
        pub tx_power: i8,
    }
}

znp_command! {
    /// Echoes the power level actually applied by the radio
    pub struct SetTxPowerRsp: Sys/Srsp/0x14 {
        pub tx_power: i8,
    }
}

impl SyncRequest for SetTxPower {
    type Response = SetTxPowerRsp;
}

// Legacy OSAL NV: items addressed by a 16-bit id, sizes capped near 244

znp_command! {
    pub struct OsalNvItemInit: Sys/Sreq/0x07 {
        pub id: u16,
        pub item_len: u16,
        pub init_value: Vec<u8>,
    }
}

status_rsp! {
    pub struct OsalNvItemInitRsp: Sys/0x07
}

impl SyncRequest for OsalNvItemInit {
    type Response = OsalNvItemInitRsp;
}

znp_command! {
    pub struct OsalNvRead: Sys/Sreq/0x08 {
        pub id: u16,
        pub offset: u8,
    }
}

znp_command! {
    pub struct OsalNvReadRsp: Sys/Srsp/0x08 {
        pub status: ZnpStatus,
        pub value: Vec<u8>,
    }
}

impl SyncRequest for OsalNvRead {
    type Response = OsalNvReadRsp;
}

znp_command! {
    pub struct OsalNvWrite: Sys/Sreq/0x09 {
        pub id: u16,
        pub offset: u8,
        pub value: Vec<u8>,
    }
}

status_rsp! {
    pub struct OsalNvWriteRsp: Sys/0x09
}

impl SyncRequest for OsalNvWrite {
    type Response = OsalNvWriteRsp;
}

znp_command! {
    pub struct OsalNvDelete: Sys/Sreq/0x12 {
        pub id: u16,
        pub item_len: u16,
    }
}

status_rsp! {
    pub struct OsalNvDeleteRsp: Sys/0x12
}

impl SyncRequest for OsalNvDelete {
    type Response = OsalNvDeleteRsp;
}

znp_command! {
    /// Returns 0 for items that do not exist
    pub struct OsalNvLength: Sys/Sreq/0x13 {
        pub id: u16,
    }
}

znp_command! {
    pub struct OsalNvLengthRsp: Sys/Srsp/0x13 {
        pub length: u16,
    }
}

impl SyncRequest for OsalNvLength {
    type Response = OsalNvLengthRsp;
}

znp_command! {
    /// Like [`OsalNvRead`] but with a 16-bit offset for large items
    pub struct OsalNvReadExt: Sys/Sreq/0x1C {
        pub id: u16,
        pub offset: u16,
    }
}

znp_command! {
    pub struct OsalNvReadExtRsp: Sys/Srsp/0x1C {
        pub status: ZnpStatus,
        pub value: Vec<u8>,
    }
}

impl SyncRequest for OsalNvReadExt {
    type Response = OsalNvReadExtRsp;
}

znp_command! {
    pub struct OsalNvWriteExt: Sys/Sreq/0x1D {
        pub id: u16,
        pub offset: u16,
        pub value: LongBytes,
    }
}

status_rsp! {
    pub struct OsalNvWriteExtRsp: Sys/0x1D
}

impl SyncRequest for OsalNvWriteExt {
    type Response = OsalNvWriteExtRsp;
}

// Extended OSAL NV: items addressed by (sys_id, item_id, sub_id)

znp_command! {
    pub struct NvCreate: Sys/Sreq/0x30 {
        pub sys_id: u8,
        pub item_id: u16,
        pub sub_id: u16,
        pub length: u32,
    }
}

status_rsp! {
    pub struct NvCreateRsp: Sys/0x30
}

impl SyncRequest for NvCreate {
    type Response = NvCreateRsp;
}

znp_command! {
    pub struct NvDelete: Sys/Sreq/0x31 {
        pub sys_id: u8,
        pub item_id: u16,
        pub sub_id: u16,
    }
}

status_rsp! {
    pub struct NvDeleteRsp: Sys/0x31
}

impl SyncRequest for NvDelete {
    type Response = NvDeleteRsp;
}

znp_command! {
    pub struct NvLength: Sys/Sreq/0x32 {
        pub sys_id: u8,
        pub item_id: u16,
        pub sub_id: u16,
    }
}

znp_command! {
    pub struct NvLengthRsp: Sys/Srsp/0x32 {
        pub length: u32,
    }
}

impl SyncRequest for NvLength {
    type Response = NvLengthRsp;
}

znp_command! {
    pub struct NvRead: Sys/Sreq/0x33 {
        pub sys_id: u8,
        pub item_id: u16,
        pub sub_id: u16,
        pub offset: u16,
        pub length: u8,
    }
}

znp_command! {
    pub struct NvReadRsp: Sys/Srsp/0x33 {
        pub status: ZnpStatus,
        pub value: Vec<u8>,
    }
}

impl SyncRequest for NvRead {
    type Response = NvReadRsp;
}

znp_command! {
    pub struct NvWrite: Sys/Sreq/0x34 {
        pub sys_id: u8,
        pub item_id: u16,
        pub sub_id: u16,
        pub offset: u16,
        pub value: Vec<u8>,
    }
}

status_rsp! {
    pub struct NvWriteRsp: Sys/0x34
}

impl SyncRequest for NvWrite {
    type Response = NvWriteRsp;
}
