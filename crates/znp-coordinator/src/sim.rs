//! In-process ZNP simulator backing the unit tests
//!
//! Owns the far end of a channel-backed link and answers MT requests the
//! way Z-Stack firmware would: NV storage is a pair of in-memory maps,
//! start-up walks through the coordinator state change, data requests are
//! confirmed (unless a test holds confirms to control their order).

use crate::version::ZStackFlavor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use znp_protocol::cmd::{af, app_cnf, sys, util, zdo, MtCommand};
use znp_protocol::frame::MtFrame;
use znp_protocol::transport::{MtLinkPeer, WriteCommand};
use znp_protocol::types::{CommandType, IeeeAddr, NwkAddr, Subsystem, ZnpStatus};

const SIM_IEEE: IeeeAddr = IeeeAddr(0x00124B00_1234_5678);
const NV_CHUNK: usize = 240;

#[derive(Debug, Clone)]
pub(crate) struct PermitJoinRecord {
    pub addr_mode: u8,
    pub dst_addr: NwkAddr,
    pub duration: u8,
}

#[derive(Default)]
pub(crate) struct SimState {
    pub legacy_nv: HashMap<u16, Vec<u8>>,
    pub extended_nv: HashMap<(u8, u16, u16), Vec<u8>>,
    pub registered_endpoints: Vec<u8>,
    /// Short addresses reported in the association table
    pub assoc_devices: Vec<NwkAddr>,
    pub data_requests: Vec<u8>,
    pub permit_join_requests: Vec<PermitJoinRecord>,
    /// When set, AF data requests are recorded but not confirmed
    pub hold_confirms: bool,
    pub device_state: u8,
    pub resets: u32,
}

pub(crate) struct Simulator {
    pub state: Arc<Mutex<SimState>>,
    frame_tx: mpsc::Sender<MtFrame>,
}

impl Simulator {
    pub fn spawn(peer: MtLinkPeer) -> Self {
        Self::spawn_with_flavor(peer, ZStackFlavor::ZStack3x)
    }

    pub fn spawn_with_flavor(peer: MtLinkPeer, flavor: ZStackFlavor) -> Self {
        let state = Arc::new(Mutex::new(SimState::default()));
        let frame_tx = peer.frame_tx.clone();
        tokio::spawn(run(peer, flavor, state.clone()));
        Self { state, frame_tx }
    }

    /// Inject a raw frame as if the firmware emitted it
    pub async fn emit(&self, frame: MtFrame) {
        self.frame_tx.send(frame).await.expect("link closed");
    }

    /// Emit the data confirm for a held transaction
    pub async fn confirm(&self, trans_id: u8, status: ZnpStatus) {
        self.emit(
            af::DataConfirm {
                status,
                endpoint: 1,
                trans_id,
            }
            .to_frame(),
        )
        .await;
    }

    pub fn hold_confirms(&self, hold: bool) {
        self.state.lock().unwrap().hold_confirms = hold;
    }
}

async fn run(mut peer: MtLinkPeer, flavor: ZStackFlavor, state: Arc<Mutex<SimState>>) {
    while let Some(cmd) = peer.write_rx.recv().await {
        let frame = match cmd {
            WriteCommand::Send(frame) => frame,
            WriteCommand::Shutdown => break,
        };
        for reply in handle(&frame, flavor, &state) {
            if peer.frame_tx.send(reply).await.is_err() {
                return;
            }
        }
    }
}

/// Deterministic IEEE address the simulator assigns to a short address
pub(crate) fn ieee_for(nwk: NwkAddr) -> IeeeAddr {
    IeeeAddr(0x00124B00_0000_0000 | u64::from(nwk.0))
}

fn srsp_for(req: &MtFrame, payload: Vec<u8>) -> MtFrame {
    MtFrame::new(req.subsystem, CommandType::Srsp, req.id, payload)
}

fn status_srsp(req: &MtFrame, status: ZnpStatus) -> MtFrame {
    srsp_for(req, vec![status.as_byte()])
}

#[allow(clippy::too_many_lines)]
fn handle(frame: &MtFrame, flavor: ZStackFlavor, state: &Arc<Mutex<SimState>>) -> Vec<MtFrame> {
    // SYS
    if sys::Ping::matches(frame) {
        return vec![sys::PingRsp { capabilities: 0x0659 }.to_frame()];
    }
    if sys::Version::matches(frame) {
        let (minor, revision) = match flavor {
            ZStackFlavor::ZStack12 => (6, None),
            ZStackFlavor::ZStack30 => (7, None),
            ZStackFlavor::ZStack3x => (7, Some(20_210_708)),
        };
        return vec![sys::VersionRsp {
            transport_rev: 2,
            product: 1,
            major: 2,
            minor,
            maint: 1,
            revision,
        }
        .to_frame()];
    }
    if sys::GetExtAddr::matches(frame) {
        return vec![sys::GetExtAddrRsp { ext_addr: SIM_IEEE }.to_frame()];
    }
    if let Ok(req) = sys::SetTxPower::from_frame(frame) {
        return vec![sys::SetTxPowerRsp {
            tx_power: req.tx_power,
        }
        .to_frame()];
    }
    if sys::ResetReq::matches(frame) {
        let mut s = state.lock().unwrap();
        s.resets += 1;
        s.device_state = 0;
        return vec![sys::ResetInd {
            reason: 0,
            transport_rev: 2,
            product: 1,
            major: 2,
            minor: 7,
            maint: 1,
        }
        .to_frame()];
    }

    // SYS legacy NV
    if let Ok(req) = sys::OsalNvLength::from_frame(frame) {
        let len = state
            .lock()
            .unwrap()
            .legacy_nv
            .get(&req.id)
            .map_or(0, Vec::len);
        return vec![sys::OsalNvLengthRsp {
            length: len as u16,
        }
        .to_frame()];
    }
    if let Ok(req) = sys::OsalNvItemInit::from_frame(frame) {
        let mut s = state.lock().unwrap();
        let status = if s.legacy_nv.contains_key(&req.id) {
            ZnpStatus::Success
        } else {
            s.legacy_nv
                .insert(req.id, vec![0; req.item_len as usize]);
            ZnpStatus::NvItemUninit
        };
        return vec![status_srsp(frame, status)];
    }
    if let Ok(req) = sys::OsalNvReadExt::from_frame(frame) {
        let s = state.lock().unwrap();
        return vec![match s.legacy_nv.get(&req.id) {
            Some(value) if (req.offset as usize) < value.len() => {
                let start = req.offset as usize;
                let end = (start + NV_CHUNK).min(value.len());
                srsp_for(frame, {
                    let mut p = vec![ZnpStatus::Success.as_byte(), (end - start) as u8];
                    p.extend_from_slice(&value[start..end]);
                    p
                })
            }
            _ => srsp_for(frame, vec![ZnpStatus::NvOperFailed.as_byte(), 0]),
        }];
    }
    if let Ok(req) = sys::OsalNvWriteExt::from_frame(frame) {
        let mut s = state.lock().unwrap();
        let status = match s.legacy_nv.get_mut(&req.id) {
            Some(value) if req.offset as usize + req.value.0.len() <= value.len() => {
                let start = req.offset as usize;
                value[start..start + req.value.0.len()].copy_from_slice(&req.value.0);
                ZnpStatus::Success
            }
            Some(_) => ZnpStatus::NvOperFailed,
            None => ZnpStatus::NvItemUninit,
        };
        return vec![status_srsp(frame, status)];
    }
    if let Ok(req) = sys::OsalNvDelete::from_frame(frame) {
        let mut s = state.lock().unwrap();
        let status = if s.legacy_nv.remove(&req.id).is_some() {
            ZnpStatus::Success
        } else {
            ZnpStatus::NvItemUninit
        };
        return vec![status_srsp(frame, status)];
    }

    // SYS extended NV
    if let Ok(req) = sys::NvLength::from_frame(frame) {
        let len = state
            .lock()
            .unwrap()
            .extended_nv
            .get(&(req.sys_id, req.item_id, req.sub_id))
            .map_or(0, Vec::len);
        return vec![sys::NvLengthRsp { length: len as u32 }.to_frame()];
    }
    if let Ok(req) = sys::NvCreate::from_frame(frame) {
        let mut s = state.lock().unwrap();
        let key = (req.sys_id, req.item_id, req.sub_id);
        let status = if s.extended_nv.contains_key(&key) {
            ZnpStatus::Success
        } else {
            s.extended_nv.insert(key, vec![0; req.length as usize]);
            ZnpStatus::NvItemUninit
        };
        return vec![status_srsp(frame, status)];
    }
    if let Ok(req) = sys::NvRead::from_frame(frame) {
        let s = state.lock().unwrap();
        let key = (req.sys_id, req.item_id, req.sub_id);
        return vec![match s.extended_nv.get(&key) {
            Some(value) if (req.offset as usize) < value.len() => {
                let start = req.offset as usize;
                let end = (start + req.length as usize).min(value.len());
                srsp_for(frame, {
                    let mut p = vec![ZnpStatus::Success.as_byte(), (end - start) as u8];
                    p.extend_from_slice(&value[start..end]);
                    p
                })
            }
            _ => srsp_for(frame, vec![ZnpStatus::NvOperFailed.as_byte(), 0]),
        }];
    }
    if let Ok(req) = sys::NvWrite::from_frame(frame) {
        let mut s = state.lock().unwrap();
        let key = (req.sys_id, req.item_id, req.sub_id);
        let status = match s.extended_nv.get_mut(&key) {
            Some(value) if req.offset as usize + req.value.len() <= value.len() => {
                let start = req.offset as usize;
                value[start..start + req.value.len()].copy_from_slice(&req.value);
                ZnpStatus::Success
            }
            Some(_) => ZnpStatus::NvOperFailed,
            None => ZnpStatus::NvItemUninit,
        };
        return vec![status_srsp(frame, status)];
    }
    if let Ok(req) = sys::NvDelete::from_frame(frame) {
        let mut s = state.lock().unwrap();
        let status = if s
            .extended_nv
            .remove(&(req.sys_id, req.item_id, req.sub_id))
            .is_some()
        {
            ZnpStatus::Success
        } else {
            ZnpStatus::NvItemUninit
        };
        return vec![status_srsp(frame, status)];
    }

    // UTIL
    if util::GetDeviceInfo::matches(frame) {
        let s = state.lock().unwrap();
        return vec![util::GetDeviceInfoRsp {
            status: ZnpStatus::Success,
            ieee_addr: SIM_IEEE,
            short_addr: NwkAddr(0x0000),
            device_type: 0x07,
            device_state: s.device_state,
            assoc_devices: s.assoc_devices.clone(),
        }
        .to_frame()];
    }
    if util::LedControl::matches(frame) {
        return vec![status_srsp(frame, ZnpStatus::Success)];
    }

    // AF
    if let Ok(req) = af::Register::from_frame(frame) {
        state.lock().unwrap().registered_endpoints.push(req.endpoint);
        return vec![status_srsp(frame, ZnpStatus::Success)];
    }
    if let Ok(req) = af::DataRequest::from_frame(frame) {
        let mut s = state.lock().unwrap();
        s.data_requests.push(req.trans_id);
        let mut replies = vec![status_srsp(frame, ZnpStatus::Success)];
        if !s.hold_confirms {
            replies.push(
                af::DataConfirm {
                    status: ZnpStatus::Success,
                    endpoint: req.dst_endpoint,
                    trans_id: req.trans_id,
                }
                .to_frame(),
            );
        }
        return replies;
    }
    if let Ok(req) = af::DataRequestExt::from_frame(frame) {
        let mut s = state.lock().unwrap();
        s.data_requests.push(req.trans_id);
        let mut replies = vec![status_srsp(frame, ZnpStatus::Success)];
        if !s.hold_confirms {
            replies.push(
                af::DataConfirm {
                    status: ZnpStatus::Success,
                    endpoint: req.dst_endpoint,
                    trans_id: req.trans_id,
                }
                .to_frame(),
            );
        }
        return replies;
    }

    // ZDO
    if zdo::StartupFromApp::matches(frame) {
        state.lock().unwrap().device_state = 0x09;
        return vec![
            zdo::StartupFromAppRsp { status: 1 }.to_frame(),
            zdo::StateChangeInd { state: 0x09 }.to_frame(),
        ];
    }
    if let Ok(req) = zdo::MgmtPermitJoinReq::from_frame(frame) {
        state.lock().unwrap().permit_join_requests.push(PermitJoinRecord {
            addr_mode: req.addr_mode,
            dst_addr: req.dst_addr,
            duration: req.duration,
        });
        let mut replies = vec![status_srsp(frame, ZnpStatus::Success)];
        if req.addr_mode == 0x02 {
            replies.push(
                zdo::MgmtPermitJoinRsp {
                    src_addr: req.dst_addr,
                    status: ZnpStatus::Success,
                }
                .to_frame(),
            );
        }
        return replies;
    }
    if let Ok(req) = zdo::IeeeAddrReq::from_frame(frame) {
        return vec![
            status_srsp(frame, ZnpStatus::Success),
            zdo::IeeeAddrRsp {
                status: ZnpStatus::Success,
                ieee_addr: ieee_for(req.nwk_addr),
                nwk_addr: req.nwk_addr,
                start_index: 0,
                assoc_devices: vec![],
            }
            .to_frame(),
        ];
    }
    if let Ok(req) = zdo::ActiveEpReq::from_frame(frame) {
        return vec![
            status_srsp(frame, ZnpStatus::Success),
            zdo::ActiveEpRsp {
                src_addr: req.nwk_addr_of_interest,
                status: ZnpStatus::Success,
                nwk_addr: req.nwk_addr_of_interest,
                active_eps: vec![1],
            }
            .to_frame(),
        ];
    }
    if let Ok(req) = zdo::SimpleDescReq::from_frame(frame) {
        return vec![
            status_srsp(frame, ZnpStatus::Success),
            zdo::SimpleDescRsp {
                src_addr: req.nwk_addr_of_interest,
                status: ZnpStatus::Success,
                nwk_addr: req.nwk_addr_of_interest,
                descriptor_len: 14,
                endpoint: req.endpoint,
                profile_id: 0x0104,
                device_id: 0x0100,
                device_version: 1,
                in_clusters: vec![0x0000, 0x0006],
                out_clusters: vec![],
            }
            .to_frame(),
        ];
    }
    if let Ok(req) = zdo::MgmtLqiReq::from_frame(frame) {
        return vec![
            status_srsp(frame, ZnpStatus::Success),
            zdo::MgmtLqiRsp {
                src_addr: req.dst_addr,
                status: ZnpStatus::Success,
                neighbor_table_entries: 0,
                start_index: req.start_index,
                neighbors: vec![],
            }
            .to_frame(),
        ];
    }
    if let Ok(req) = zdo::MgmtRtgReq::from_frame(frame) {
        return vec![
            status_srsp(frame, ZnpStatus::Success),
            zdo::MgmtRtgRsp {
                src_addr: req.dst_addr,
                status: ZnpStatus::Success,
                routing_table_entries: 0,
                start_index: req.start_index,
                entries: vec![],
            }
            .to_frame(),
        ];
    }
    if let Ok(req) = zdo::MgmtLeaveReq::from_frame(frame) {
        return vec![
            status_srsp(frame, ZnpStatus::Success),
            zdo::MgmtLeaveRsp {
                src_addr: req.dst_addr,
                status: ZnpStatus::Success,
            }
            .to_frame(),
        ];
    }

    // APP_CNF
    if app_cnf::BdbSetChannel::matches(frame)
        || app_cnf::BdbSetTcRequireKeyExchange::matches(frame)
        || app_cnf::SetNwkFrameCounter::matches(frame)
    {
        return vec![status_srsp(frame, ZnpStatus::Success)];
    }
    if let Ok(req) = app_cnf::BdbStartCommissioning::from_frame(frame) {
        state.lock().unwrap().device_state = 0x09;
        return vec![
            status_srsp(frame, ZnpStatus::Success),
            app_cnf::BdbCommissioningNotification {
                status: app_cnf::commissioning_status::SUCCESS,
                mode: req.mode,
                remaining_modes: 0,
            }
            .to_frame(),
            zdo::StateChangeInd { state: 0x09 }.to_frame(),
        ];
    }

    if frame.cmd_type == CommandType::Sreq {
        // Unknown SREQ: answer from the error subsystem so the waiter fails
        // loudly with an SRSP mismatch instead of timing out
        return vec![MtFrame::new(
            Subsystem::RpcError,
            CommandType::Srsp,
            0x00,
            vec![frame.cmd0(), frame.id],
        )];
    }
    Vec::new()
}
