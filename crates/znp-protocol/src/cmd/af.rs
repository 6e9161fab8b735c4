//! AF subsystem: application framework data plane

use crate::cmd::{Indication, LongBytes, SyncRequest, Wire};
use crate::types::{NwkAddr, ZnpStatus};

/// Destination addressing mode for [`DataRequestExt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressMode {
    AddrNotPresent = 0x00,
    Group = 0x01,
    Addr16Bit = 0x02,
    Addr64Bit = 0x03,
    Broadcast = 0x0F,
}

impl Wire for AddressMode {
    fn put(&self, buf: &mut Vec<u8>) {
        (*self as u8).put(buf);
    }
    fn take(buf: &mut &[u8]) -> Option<Self> {
        match u8::take(buf)? {
            0x00 => Some(AddressMode::AddrNotPresent),
            0x01 => Some(AddressMode::Group),
            0x02 => Some(AddressMode::Addr16Bit),
            0x03 => Some(AddressMode::Addr64Bit),
            0x0F => Some(AddressMode::Broadcast),
            _ => None,
        }
    }
}

/// TX option bits of [`DataRequest`]
pub mod tx_options {
    pub const WILDCARD_PROFILE_ID: u8 = 0x02;
    pub const APS_ACK: u8 = 0x10;
    pub const DISCOVER_ROUTE: u8 = 0x20;
    pub const APS_SECURITY: u8 = 0x40;
    pub const SKIP_ROUTING: u8 = 0x80;
}

znp_command! {
    /// Register an application endpoint on the coprocessor
    pub struct Register: Af/Sreq/0x00 {
        pub endpoint: u8,
        pub profile_id: u16,
        pub device_id: u16,
        pub device_version: u8,
        pub latency_req: u8,
        pub in_clusters: Vec<u16>,
        pub out_clusters: Vec<u16>,
    }
}

status_rsp! {
    pub struct RegisterRsp: Af/0x00
}

impl SyncRequest for Register {
    type Response = RegisterRsp;
}

znp_command! {
    /// Unicast data request; confirmed by [`DataConfirm`] with the same
    /// transaction id
    pub struct DataRequest: Af/Sreq/0x01 {
        pub dst_addr: NwkAddr,
        pub dst_endpoint: u8,
        pub src_endpoint: u8,
        pub cluster_id: u16,
        pub trans_id: u8,
        pub options: u8,
        pub radius: u8,
        pub data: Vec<u8>,
    }
}

status_rsp! {
    pub struct DataRequestRsp: Af/0x01
}

impl SyncRequest for DataRequest {
    type Response = DataRequestRsp;
}

znp_command! {
    /// Extended data request: group/broadcast/IEEE addressing, inter-PAN,
    /// and payloads above the classic 128-byte ceiling
    pub struct DataRequestExt: Af/Sreq/0x02 {
        pub dst_addr_mode: AddressMode,
        pub dst_addr: u64,
        pub dst_endpoint: u8,
        pub dst_pan_id: u16,
        pub src_endpoint: u8,
        pub cluster_id: u16,
        pub trans_id: u8,
        pub options: u8,
        pub radius: u8,
        pub data: LongBytes,
    }
}

status_rsp! {
    pub struct DataRequestExtRsp: Af/0x02
}

impl SyncRequest for DataRequestExt {
    type Response = DataRequestExtRsp;
}

znp_command! {
    pub struct DataConfirm: Af/Areq/0x80 {
        pub status: ZnpStatus,
        pub endpoint: u8,
        pub trans_id: u8,
    }
}

impl Indication for DataConfirm {}

znp_command! {
    pub struct IncomingMsg: Af/Areq/0x81 {
        pub group_id: u16,
        pub cluster_id: u16,
        pub src_addr: NwkAddr,
        pub src_endpoint: u8,
        pub dst_endpoint: u8,
        pub was_broadcast: bool,
        pub lqi: u8,
        pub security_use: bool,
        pub timestamp: u32,
        pub trans_seq: u8,
        pub data: Vec<u8>,
    }
}

impl Indication for IncomingMsg {}

znp_command! {
    pub struct IncomingMsgExt: Af/Areq/0x82 {
        pub group_id: u16,
        pub cluster_id: u16,
        pub src_addr_mode: AddressMode,
        pub src_addr: u64,
        pub src_endpoint: u8,
        pub src_pan_id: u16,
        pub dst_endpoint: u8,
        pub was_broadcast: bool,
        pub lqi: u8,
        pub security_use: bool,
        pub timestamp: u32,
        pub trans_seq: u8,
        pub data: LongBytes,
    }
}

impl Indication for IncomingMsgExt {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::MtCommand;

    #[test]
    fn test_data_request_round_trip() {
        let req = DataRequest {
            dst_addr: NwkAddr(0x1234),
            dst_endpoint: 1,
            src_endpoint: 1,
            cluster_id: 0x0006,
            trans_id: 42,
            options: tx_options::APS_ACK,
            radius: 30,
            data: vec![0x01, 0x00, 0x01],
        };
        let decoded = DataRequest::from_payload(&req.to_payload()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_incoming_msg_decode() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u16.to_le_bytes()); // group
        payload.extend_from_slice(&0x0006u16.to_le_bytes()); // cluster
        payload.extend_from_slice(&0xAB12u16.to_le_bytes()); // src addr
        payload.push(1); // src ep
        payload.push(1); // dst ep
        payload.push(0); // broadcast
        payload.push(0x9C); // lqi
        payload.push(0); // security
        payload.extend_from_slice(&0u32.to_le_bytes()); // timestamp
        payload.push(7); // seq
        payload.extend_from_slice(&[2, 0xAA, 0xBB]); // len + data

        let msg = IncomingMsg::from_payload(&payload).unwrap();
        assert_eq!(msg.src_addr, NwkAddr(0xAB12));
        assert_eq!(msg.lqi, 0x9C);
        assert_eq!(msg.data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_confirm_matches_frame() {
        let confirm = DataConfirm {
            status: ZnpStatus::Success,
            endpoint: 1,
            trans_id: 42,
        };
        let frame = confirm.to_frame();
        assert!(DataConfirm::matches(&frame));
        assert!(!IncomingMsg::matches(&frame));
    }
}
