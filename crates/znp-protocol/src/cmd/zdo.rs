//! ZDO subsystem: device discovery, binding and network management
//!
//! Most requests here are a two-step exchange: the SREQ/SRSP pair only
//! acknowledges that the coprocessor accepted the request, and the actual
//! over-the-air answer arrives later as an AREQ (`...Rsp`) carrying the
//! responder's address.

use crate::cmd::{Indication, SyncRequest};
use crate::types::{IeeeAddr, NwkAddr, ZnpStatus};

/// ZDO device state reported by [`StateChangeInd`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    HoldAutoStart = 0x00,
    InitializedNotStarted = 0x01,
    DiscoveringPans = 0x02,
    Joining = 0x03,
    Rejoining = 0x04,
    JoinedNotAuthenticated = 0x05,
    JoinedEndDevice = 0x06,
    JoinedRouter = 0x07,
    StartingAsCoordinator = 0x08,
    StartedAsCoordinator = 0x09,
    LostParent = 0x0A,
}

impl DeviceState {
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(DeviceState::HoldAutoStart),
            0x01 => Some(DeviceState::InitializedNotStarted),
            0x02 => Some(DeviceState::DiscoveringPans),
            0x03 => Some(DeviceState::Joining),
            0x04 => Some(DeviceState::Rejoining),
            0x05 => Some(DeviceState::JoinedNotAuthenticated),
            0x06 => Some(DeviceState::JoinedEndDevice),
            0x07 => Some(DeviceState::JoinedRouter),
            0x08 => Some(DeviceState::StartingAsCoordinator),
            0x09 => Some(DeviceState::StartedAsCoordinator),
            0x0A => Some(DeviceState::LostParent),
            _ => None,
        }
    }
}

/// Broadcast destination for [`MgmtPermitJoinReq`] reaching all routers
pub const PERMIT_JOIN_BROADCAST: NwkAddr = NwkAddr(0xFFFC);

// Address and descriptor discovery

znp_command! {
    pub struct NwkAddrReq: Zdo/Sreq/0x00 {
        pub ieee_addr: IeeeAddr,
        pub req_type: u8,
        pub start_index: u8,
    }
}

status_rsp! {
    pub struct NwkAddrReqRsp: Zdo/0x00
}

impl SyncRequest for NwkAddrReq {
    type Response = NwkAddrReqRsp;
}

znp_command! {
    pub struct NwkAddrRsp: Zdo/Areq/0x80 {
        pub status: ZnpStatus,
        pub ieee_addr: IeeeAddr,
        pub nwk_addr: NwkAddr,
        pub start_index: u8,
        pub assoc_devices: Vec<NwkAddr>,
    }
}

impl Indication for NwkAddrRsp {}

znp_command! {
    pub struct IeeeAddrReq: Zdo/Sreq/0x01 {
        pub nwk_addr: NwkAddr,
        pub req_type: u8,
        pub start_index: u8,
    }
}

status_rsp! {
    pub struct IeeeAddrReqRsp: Zdo/0x01
}

impl SyncRequest for IeeeAddrReq {
    type Response = IeeeAddrReqRsp;
}

znp_command! {
    pub struct IeeeAddrRsp: Zdo/Areq/0x81 {
        pub status: ZnpStatus,
        pub ieee_addr: IeeeAddr,
        pub nwk_addr: NwkAddr,
        pub start_index: u8,
        pub assoc_devices: Vec<NwkAddr>,
    }
}

impl Indication for IeeeAddrRsp {}

znp_command! {
    pub struct NodeDescReq: Zdo/Sreq/0x02 {
        pub dst_addr: NwkAddr,
        pub nwk_addr_of_interest: NwkAddr,
    }
}

status_rsp! {
    pub struct NodeDescReqRsp: Zdo/0x02
}

impl SyncRequest for NodeDescReq {
    type Response = NodeDescReqRsp;
}

znp_command! {
    pub struct NodeDescRsp: Zdo/Areq/0x82 {
        pub src_addr: NwkAddr,
        pub status: ZnpStatus,
        pub nwk_addr: NwkAddr,
        /// Logical type in bits 0..2, descriptor availability flags above
        pub type_flags: u8,
        pub aps_flags: u8,
        pub mac_capabilities: u8,
        pub manufacturer_code: u16,
        pub max_buffer_size: u8,
        pub max_in_transfer: u16,
        pub server_mask: u16,
        pub max_out_transfer: u16,
        pub descriptor_capabilities: u8,
    }
}

impl Indication for NodeDescRsp {}

znp_command! {
    pub struct SimpleDescReq: Zdo/Sreq/0x04 {
        pub dst_addr: NwkAddr,
        pub nwk_addr_of_interest: NwkAddr,
        pub endpoint: u8,
    }
}

status_rsp! {
    pub struct SimpleDescReqRsp: Zdo/0x04
}

impl SyncRequest for SimpleDescReq {
    type Response = SimpleDescReqRsp;
}

znp_command! {
    pub struct SimpleDescRsp: Zdo/Areq/0x84 {
        pub src_addr: NwkAddr,
        pub status: ZnpStatus,
        pub nwk_addr: NwkAddr,
        pub descriptor_len: u8,
        pub endpoint: u8,
        pub profile_id: u16,
        pub device_id: u16,
        pub device_version: u8,
        pub in_clusters: Vec<u16>,
        pub out_clusters: Vec<u16>,
    }
}

impl Indication for SimpleDescRsp {}

znp_command! {
    pub struct ActiveEpReq: Zdo/Sreq/0x05 {
        pub dst_addr: NwkAddr,
        pub nwk_addr_of_interest: NwkAddr,
    }
}

status_rsp! {
    pub struct ActiveEpReqRsp: Zdo/0x05
}

impl SyncRequest for ActiveEpReq {
    type Response = ActiveEpReqRsp;
}

znp_command! {
    pub struct ActiveEpRsp: Zdo/Areq/0x85 {
        pub src_addr: NwkAddr,
        pub status: ZnpStatus,
        pub nwk_addr: NwkAddr,
        pub active_eps: Vec<u8>,
    }
}

impl Indication for ActiveEpRsp {}

// Binding

znp_command! {
    pub struct BindReq: Zdo/Sreq/0x21 {
        pub dst_addr: NwkAddr,
        pub src_ieee: IeeeAddr,
        pub src_endpoint: u8,
        pub cluster_id: u16,
        pub dst_addr_mode: u8,
        pub dst_address: u64,
        pub dst_endpoint: u8,
    }
}

status_rsp! {
    pub struct BindReqRsp: Zdo/0x21
}

impl SyncRequest for BindReq {
    type Response = BindReqRsp;
}

znp_command! {
    pub struct BindRsp: Zdo/Areq/0xA1 {
        pub src_addr: NwkAddr,
        pub status: ZnpStatus,
    }
}

impl Indication for BindRsp {}

znp_command! {
    pub struct UnbindReq: Zdo/Sreq/0x22 {
        pub dst_addr: NwkAddr,
        pub src_ieee: IeeeAddr,
        pub src_endpoint: u8,
        pub cluster_id: u16,
        pub dst_addr_mode: u8,
        pub dst_address: u64,
        pub dst_endpoint: u8,
    }
}

status_rsp! {
    pub struct UnbindReqRsp: Zdo/0x22
}

impl SyncRequest for UnbindReq {
    type Response = UnbindReqRsp;
}

znp_command! {
    pub struct UnbindRsp: Zdo/Areq/0xA2 {
        pub src_addr: NwkAddr,
        pub status: ZnpStatus,
    }
}

impl Indication for UnbindRsp {}

// Management

wire_struct! {
    /// One row of a `MgmtLqiRsp` neighbour table page
    pub struct Neighbor {
        pub extended_pan_id: u64,
        pub ext_addr: IeeeAddr,
        pub nwk_addr: NwkAddr,
        /// Device type (0..2), rx-on-when-idle (2..4), relationship (4..7)
        pub packed: u8,
        pub permit_joining: u8,
        pub depth: u8,
        pub lqi: u8,
    }
}

impl Neighbor {
    #[must_use]
    pub fn device_type(&self) -> u8 {
        self.packed & 0x03
    }

    #[must_use]
    pub fn rx_on_when_idle(&self) -> bool {
        (self.packed >> 2) & 0x03 == 0x01
    }

    #[must_use]
    pub fn relationship(&self) -> u8 {
        (self.packed >> 4) & 0x07
    }
}

znp_command! {
    pub struct MgmtLqiReq: Zdo/Sreq/0x31 {
        pub dst_addr: NwkAddr,
        pub start_index: u8,
    }
}

status_rsp! {
    pub struct MgmtLqiReqRsp: Zdo/0x31
}

impl SyncRequest for MgmtLqiReq {
    type Response = MgmtLqiReqRsp;
}

znp_command! {
    pub struct MgmtLqiRsp: Zdo/Areq/0xB1 {
        pub src_addr: NwkAddr,
        pub status: ZnpStatus,
        pub neighbor_table_entries: u8,
        pub start_index: u8,
        pub neighbors: Vec<Neighbor>,
    }
}

impl Indication for MgmtLqiRsp {}

wire_struct! {
    pub struct RoutingEntry {
        pub dst_addr: NwkAddr,
        /// Route status (0..3), memory-constrained, many-to-one, route-record-required
        pub packed: u8,
        pub next_hop: NwkAddr,
    }
}

impl RoutingEntry {
    #[must_use]
    pub fn route_status(&self) -> u8 {
        self.packed & 0x07
    }
}

znp_command! {
    pub struct MgmtRtgReq: Zdo/Sreq/0x32 {
        pub dst_addr: NwkAddr,
        pub start_index: u8,
    }
}

status_rsp! {
    pub struct MgmtRtgReqRsp: Zdo/0x32
}

impl SyncRequest for MgmtRtgReq {
    type Response = MgmtRtgReqRsp;
}

znp_command! {
    pub struct MgmtRtgRsp: Zdo/Areq/0xB2 {
        pub src_addr: NwkAddr,
        pub status: ZnpStatus,
        pub routing_table_entries: u8,
        pub start_index: u8,
        pub entries: Vec<RoutingEntry>,
    }
}

impl Indication for MgmtRtgRsp {}

znp_command! {
    pub struct MgmtLeaveReq: Zdo/Sreq/0x34 {
        pub dst_addr: NwkAddr,
        pub device_address: IeeeAddr,
        /// Bit 0: rejoin, bit 1: remove children
        pub remove_children_rejoin: u8,
    }
}

status_rsp! {
    pub struct MgmtLeaveReqRsp: Zdo/0x34
}

impl SyncRequest for MgmtLeaveReq {
    type Response = MgmtLeaveReqRsp;
}

znp_command! {
    pub struct MgmtLeaveRsp: Zdo/Areq/0xB4 {
        pub src_addr: NwkAddr,
        pub status: ZnpStatus,
    }
}

impl Indication for MgmtLeaveRsp {}

znp_command! {
    pub struct MgmtPermitJoinReq: Zdo/Sreq/0x36 {
        /// 0x02 to address one router, 0x0F for the all-routers broadcast
        pub addr_mode: u8,
        pub dst_addr: NwkAddr,
        pub duration: u8,
        pub tc_significance: u8,
    }
}

status_rsp! {
    pub struct MgmtPermitJoinReqRsp: Zdo/0x36
}

impl SyncRequest for MgmtPermitJoinReq {
    type Response = MgmtPermitJoinReqRsp;
}

znp_command! {
    pub struct MgmtPermitJoinRsp: Zdo/Areq/0xB6 {
        pub src_addr: NwkAddr,
        pub status: ZnpStatus,
    }
}

impl Indication for MgmtPermitJoinRsp {}

znp_command! {
    pub struct MgmtNwkUpdateReq: Zdo/Sreq/0x37 {
        pub dst_addr: NwkAddr,
        pub dst_addr_mode: u8,
        pub channel_mask: u32,
        pub scan_duration: u8,
        pub scan_count: u8,
        pub nwk_manager_addr: NwkAddr,
    }
}

status_rsp! {
    pub struct MgmtNwkUpdateReqRsp: Zdo/0x37
}

impl SyncRequest for MgmtNwkUpdateReq {
    type Response = MgmtNwkUpdateReqRsp;
}

// Start-up

znp_command! {
    /// Kick the stack out of HOLD and start/resume the network
    pub struct StartupFromApp: Zdo/Sreq/0x40 {
        pub start_delay: u16,
    }
}

znp_command! {
    /// 0 = restored from NVRAM, 1 = new network state, 2 = leave and not started
    pub struct StartupFromAppRsp: Zdo/Srsp/0x40 {
        pub status: u8,
    }
}

impl SyncRequest for StartupFromApp {
    type Response = StartupFromAppRsp;
}

// Unsolicited indications

znp_command! {
    pub struct StateChangeInd: Zdo/Areq/0xC0 {
        pub state: u8,
    }
}

impl Indication for StateChangeInd {}

impl StateChangeInd {
    #[must_use]
    pub fn device_state(&self) -> Option<DeviceState> {
        DeviceState::from_byte(self.state)
    }
}

znp_command! {
    pub struct EndDeviceAnnceInd: Zdo/Areq/0xC1 {
        pub src_addr: NwkAddr,
        pub nwk_addr: NwkAddr,
        pub ieee_addr: IeeeAddr,
        pub capabilities: u8,
    }
}

impl Indication for EndDeviceAnnceInd {}

impl EndDeviceAnnceInd {
    /// FFD bit of the MAC capability flags
    #[must_use]
    pub fn is_router(&self) -> bool {
        (self.capabilities & 0x02) != 0
    }

    #[must_use]
    pub fn is_mains_powered(&self) -> bool {
        (self.capabilities & 0x04) != 0
    }

    #[must_use]
    pub fn rx_on_when_idle(&self) -> bool {
        (self.capabilities & 0x08) != 0
    }
}

znp_command! {
    pub struct SrcRtgInd: Zdo/Areq/0xC4 {
        pub dst_addr: NwkAddr,
        pub relays: Vec<NwkAddr>,
    }
}

impl Indication for SrcRtgInd {}

znp_command! {
    pub struct LeaveInd: Zdo/Areq/0xC9 {
        pub src_addr: NwkAddr,
        pub ieee_addr: IeeeAddr,
        pub request: bool,
        pub remove: bool,
        pub rejoin: bool,
    }
}

impl Indication for LeaveInd {}

znp_command! {
    /// Trust-centre notification of a device joining through us
    pub struct TcDevInd: Zdo/Areq/0xCA {
        pub nwk_addr: NwkAddr,
        pub ieee_addr: IeeeAddr,
        pub parent_addr: NwkAddr,
    }
}

impl Indication for TcDevInd {}

znp_command! {
    pub struct PermitJoinInd: Zdo/Areq/0xCB {
        pub duration: u8,
    }
}

impl Indication for PermitJoinInd {}

/// Over-the-air ZDO responses all lead with the responder's status
macro_rules! zdo_status_reply {
    ($($name:ident),+ $(,)?) => {
        $(impl $crate::cmd::StatusReply for $name {
            fn status(&self) -> $crate::types::ZnpStatus {
                self.status
            }
        })+
    };
}

zdo_status_reply!(
    NwkAddrRsp,
    IeeeAddrRsp,
    NodeDescRsp,
    SimpleDescRsp,
    ActiveEpRsp,
    BindRsp,
    UnbindRsp,
    MgmtLqiRsp,
    MgmtRtgRsp,
    MgmtLeaveRsp,
    MgmtPermitJoinRsp,
);
