//! UTIL subsystem: device info and hardware control

use crate::cmd::SyncRequest;
use crate::types::{IeeeAddr, NwkAddr, ZnpStatus};

znp_command! {
    pub struct GetDeviceInfo: Util/Sreq/0x00 {}
}

znp_command! {
    pub struct GetDeviceInfoRsp: Util/Srsp/0x00 {
        pub status: ZnpStatus,
        pub ieee_addr: IeeeAddr,
        pub short_addr: NwkAddr,
        pub device_type: u8,
        pub device_state: u8,
        pub assoc_devices: Vec<NwkAddr>,
    }
}

impl SyncRequest for GetDeviceInfo {
    type Response = GetDeviceInfoRsp;
}

znp_command! {
    /// Drive an on-board LED; mode 0 = off, 1 = on, 4 = flash, 5 = toggle
    pub struct LedControl: Util/Sreq/0x0A {
        pub led_id: u8,
        pub mode: u8,
    }
}

status_rsp! {
    pub struct LedControlRsp: Util/0x0A
}

impl SyncRequest for LedControl {
    type Response = LedControlRsp;
}
