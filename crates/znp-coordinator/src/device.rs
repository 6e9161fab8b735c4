//! In-memory device table
//!
//! The coordinator owns the authoritative table of devices on its network.
//! It is rebuilt from coordinator NVRAM (or a restored backup) at start-up
//! and kept current from ZDO indications. Reads hand out snapshots.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use znp_protocol::types::{IeeeAddr, NwkAddr};

/// Neighbour-table relationship of a device to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    Parent,
    Child,
    Sibling,
    NoneOfTheAbove,
    PreviousChild,
}

impl Relationship {
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Relationship::Parent),
            1 => Some(Relationship::Child),
            2 => Some(Relationship::Sibling),
            3 => Some(Relationship::NoneOfTheAbove),
            4 => Some(Relationship::PreviousChild),
            _ => None,
        }
    }
}

/// A device known to the coordinator
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub ieee: IeeeAddr,
    pub nwk: NwkAddr,
    pub lqi: Option<u8>,
    pub relationship: Option<Relationship>,
    pub rx_on_when_idle: Option<bool>,
    pub last_seen: Option<Instant>,
}

impl DeviceEntry {
    #[must_use]
    pub fn new(ieee: IeeeAddr, nwk: NwkAddr) -> Self {
        Self {
            ieee,
            nwk,
            lqi: None,
            relationship: None,
            rx_on_when_idle: None,
            last_seen: None,
        }
    }
}

/// Device table keyed by IEEE address
#[derive(Clone, Default)]
pub struct DeviceTable {
    devices: Arc<DashMap<IeeeAddr, DeviceEntry>>,
}

impl DeviceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a device; returns true when the device is new
    pub fn upsert(&self, ieee: IeeeAddr, nwk: NwkAddr) -> bool {
        let mut is_new = false;
        self.devices
            .entry(ieee)
            .and_modify(|entry| {
                entry.nwk = nwk;
                entry.last_seen = Some(Instant::now());
            })
            .or_insert_with(|| {
                is_new = true;
                let mut entry = DeviceEntry::new(ieee, nwk);
                entry.last_seen = Some(Instant::now());
                entry
            });
        is_new
    }

    pub fn remove(&self, ieee: IeeeAddr) -> Option<DeviceEntry> {
        self.devices.remove(&ieee).map(|(_, entry)| entry)
    }

    pub fn touch_by_nwk(&self, nwk: NwkAddr) {
        for mut entry in self.devices.iter_mut() {
            if entry.nwk == nwk {
                entry.last_seen = Some(Instant::now());
                break;
            }
        }
    }

    pub fn update_lqi(&self, ieee: IeeeAddr, lqi: u8) {
        if let Some(mut entry) = self.devices.get_mut(&ieee) {
            entry.lqi = Some(lqi);
        }
    }

    #[must_use]
    pub fn get(&self, ieee: IeeeAddr) -> Option<DeviceEntry> {
        self.devices.get(&ieee).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn find_by_nwk(&self, nwk: NwkAddr) -> Option<DeviceEntry> {
        self.devices
            .iter()
            .find(|r| r.nwk == nwk)
            .map(|r| r.value().clone())
    }

    /// Snapshot of every known device
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeviceEntry> {
        self.devices.iter().map(|r| r.value().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&self) {
        self.devices.clear();
    }
}
