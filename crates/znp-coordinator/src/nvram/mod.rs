//! Structured NVRAM access
//!
//! Reads and writes every firmware-known persistent item across the two
//! OSAL storage layouts: legacy items keyed by a 16-bit id, extended items
//! keyed by (sys id, item id, sub id). Multi-step operations take an
//! exclusive lease so concurrent writers cannot corrupt an iteration.

pub mod items;

use crate::error::CoordinatorError;
use crate::version::ZStackFlavor;
use items::{ExNvId, NvId, BACKUP_EX_TABLES, BACKUP_IDS, NETWORK_RESET_EX_TABLES};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use znp_protocol::cmd::sys;
use znp_protocol::types::{ProtocolError, ZnpStatus};
use znp_protocol::MtBus;

/// Largest chunk moved by one NV read/write SREQ
const CHUNK: usize = 240;

/// Deadline for `SYS.RESET_IND` after a reset request
const RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// How deep a reset reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetDepth {
    /// Clear only network-forming state; configuration survives
    NetworkOnly,
    /// Clear every catalogued item and reinitialise the adapter
    Factory,
}

/// Raw NVRAM contents captured by [`NvramManager::backup`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NvramSnapshot {
    /// Legacy items present on the device, keyed by id
    pub legacy: BTreeMap<u16, Vec<u8>>,
    /// Extended items, keyed by (sys id, item id, sub id)
    pub extended: BTreeMap<(u8, u16, u16), Vec<u8>>,
}

/// NVRAM manager bound to one bus
#[derive(Clone)]
pub struct NvramManager {
    bus: MtBus,
    lease: Arc<Mutex<()>>,
}

impl NvramManager {
    #[must_use]
    pub fn new(bus: MtBus) -> Self {
        Self {
            bus,
            lease: Arc::new(Mutex::new(())),
        }
    }

    fn status_err(command: &'static str, status: ZnpStatus) -> CoordinatorError {
        ProtocolError::CommandStatus { command, status }.into()
    }

    /// Length of a legacy item; 0 means the item does not exist
    pub async fn item_length(&self, id: u16) -> Result<usize, CoordinatorError> {
        let rsp = self.bus.request(sys::OsalNvLength { id }).await?;
        Ok(rsp.length as usize)
    }

    /// Read a whole legacy item
    pub async fn read_item(&self, item: NvId) -> Result<Vec<u8>, CoordinatorError> {
        self.read_raw(item.id())
            .await?
            .ok_or(CoordinatorError::NvramMissing(item.name()))
    }

    /// Read a legacy item by raw id, `None` when absent
    pub async fn read_raw(&self, id: u16) -> Result<Option<Vec<u8>>, CoordinatorError> {
        let length = self.item_length(id).await?;
        if length == 0 {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let rsp = self
                .bus
                .request(sys::OsalNvReadExt {
                    id,
                    offset: out.len() as u16,
                })
                .await?;
            if !rsp.status.is_success() {
                return Err(Self::status_err("Sys.OsalNvReadExt", rsp.status));
            }
            if rsp.value.is_empty() {
                return Err(CoordinatorError::NvramMismatch(items::name_of(id)));
            }
            out.extend_from_slice(&rsp.value);
        }
        out.truncate(length);
        Ok(Some(out))
    }

    /// Write a whole legacy item, creating or resizing it first
    ///
    /// Idempotent: retrying a completed write leaves the item unchanged.
    pub async fn write_item(&self, item: NvId, value: &[u8]) -> Result<(), CoordinatorError> {
        self.write_raw(item.id(), value).await
    }

    pub async fn write_raw(&self, id: u16, value: &[u8]) -> Result<(), CoordinatorError> {
        let existing = self.item_length(id).await?;
        if existing != 0 && existing != value.len() {
            self.delete_raw(id).await?;
        }
        if existing == 0 || existing != value.len() {
            let rsp = self
                .bus
                .request(sys::OsalNvItemInit {
                    id,
                    item_len: value.len() as u16,
                    init_value: Vec::new(),
                })
                .await?;
            // NV_ITEM_UNINIT means the item was freshly created
            if !matches!(rsp.status, ZnpStatus::Success | ZnpStatus::NvItemUninit) {
                return Err(Self::status_err("Sys.OsalNvItemInit", rsp.status));
            }
        }

        for (index, chunk) in value.chunks(CHUNK).enumerate() {
            let rsp = self
                .bus
                .request(sys::OsalNvWriteExt {
                    id,
                    offset: (index * CHUNK) as u16,
                    value: znp_protocol::cmd::LongBytes(chunk.to_vec()),
                })
                .await?;
            if !rsp.status.is_success() {
                return Err(Self::status_err("Sys.OsalNvWriteExt", rsp.status));
            }
        }
        Ok(())
    }

    /// Delete a legacy item; absent items are not an error
    pub async fn delete_item(&self, item: NvId) -> Result<(), CoordinatorError> {
        self.delete_raw(item.id()).await
    }

    async fn delete_raw(&self, id: u16) -> Result<(), CoordinatorError> {
        let length = self.item_length(id).await?;
        if length == 0 {
            return Ok(());
        }
        let rsp = self
            .bus
            .request(sys::OsalNvDelete {
                id,
                item_len: length as u16,
            })
            .await?;
        if !rsp.status.is_success() {
            return Err(Self::status_err("Sys.OsalNvDelete", rsp.status));
        }
        Ok(())
    }

    /// Length of an extended item; 0 means absent
    pub async fn ex_length(
        &self,
        sys_id: u8,
        item_id: u16,
        sub_id: u16,
    ) -> Result<usize, CoordinatorError> {
        let rsp = self
            .bus
            .request(sys::NvLength {
                sys_id,
                item_id,
                sub_id,
            })
            .await?;
        Ok(rsp.length as usize)
    }

    /// Read a whole extended item, `None` when absent
    pub async fn ex_read(
        &self,
        sys_id: u8,
        item_id: u16,
        sub_id: u16,
    ) -> Result<Option<Vec<u8>>, CoordinatorError> {
        let length = self.ex_length(sys_id, item_id, sub_id).await?;
        if length == 0 {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let chunk = (length - out.len()).min(CHUNK) as u8;
            let rsp = self
                .bus
                .request(sys::NvRead {
                    sys_id,
                    item_id,
                    sub_id,
                    offset: out.len() as u16,
                    length: chunk,
                })
                .await?;
            if !rsp.status.is_success() {
                return Err(Self::status_err("Sys.NvRead", rsp.status));
            }
            if rsp.value.is_empty() {
                return Err(CoordinatorError::NvramMismatch("EX_NV_ITEM"));
            }
            out.extend_from_slice(&rsp.value);
        }
        out.truncate(length);
        Ok(Some(out))
    }

    /// Write a whole extended item, creating it if needed
    pub async fn ex_write(
        &self,
        sys_id: u8,
        item_id: u16,
        sub_id: u16,
        value: &[u8],
    ) -> Result<(), CoordinatorError> {
        let existing = self.ex_length(sys_id, item_id, sub_id).await?;
        if existing != 0 && existing != value.len() {
            self.ex_delete(sys_id, item_id, sub_id).await?;
        }
        if existing == 0 || existing != value.len() {
            let rsp = self
                .bus
                .request(sys::NvCreate {
                    sys_id,
                    item_id,
                    sub_id,
                    length: value.len() as u32,
                })
                .await?;
            if !matches!(rsp.status, ZnpStatus::Success | ZnpStatus::NvItemUninit) {
                return Err(Self::status_err("Sys.NvCreate", rsp.status));
            }
        }

        for (index, chunk) in value.chunks(CHUNK).enumerate() {
            let rsp = self
                .bus
                .request(sys::NvWrite {
                    sys_id,
                    item_id,
                    sub_id,
                    offset: (index * CHUNK) as u16,
                    value: chunk.to_vec(),
                })
                .await?;
            if !rsp.status.is_success() {
                return Err(Self::status_err("Sys.NvWrite", rsp.status));
            }
        }
        Ok(())
    }

    pub async fn ex_delete(
        &self,
        sys_id: u8,
        item_id: u16,
        sub_id: u16,
    ) -> Result<(), CoordinatorError> {
        if self.ex_length(sys_id, item_id, sub_id).await? == 0 {
            return Ok(());
        }
        let rsp = self
            .bus
            .request(sys::NvDelete {
                sys_id,
                item_id,
                sub_id,
            })
            .await?;
        if !rsp.status.is_success() {
            return Err(Self::status_err("Sys.NvDelete", rsp.status));
        }
        Ok(())
    }

    /// Capture every catalogued item present on the device
    ///
    /// Missing items are recorded as absent, never raised as errors.
    pub async fn backup(&self, flavor: ZStackFlavor) -> Result<NvramSnapshot, CoordinatorError> {
        let _lease = self.lease.lock().await;
        let mut snapshot = NvramSnapshot::default();

        for &item in BACKUP_IDS {
            if let Some(value) = self.read_raw(item.id()).await? {
                snapshot.legacy.insert(item.id(), value);
            } else {
                tracing::debug!("NV item {} absent, skipping", item.name());
            }
        }

        if flavor.uses_extended_nv() {
            for &table in BACKUP_EX_TABLES {
                self.backup_ex_table(table, &mut snapshot).await?;
            }
        }

        tracing::info!(
            "NVRAM backup captured {} legacy and {} extended items",
            snapshot.legacy.len(),
            snapshot.extended.len()
        );
        Ok(snapshot)
    }

    /// Walk a table's sub ids until the first absent entry
    async fn backup_ex_table(
        &self,
        table: ExNvId,
        snapshot: &mut NvramSnapshot,
    ) -> Result<(), CoordinatorError> {
        for sub_id in 0u16.. {
            match self
                .ex_read(items::NV_SYS_ID_ZSTACK, table.item_id(), sub_id)
                .await?
            {
                Some(value) => {
                    snapshot
                        .extended
                        .insert((items::NV_SYS_ID_ZSTACK, table.item_id(), sub_id), value);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Write a snapshot back and verify every item by read-back
    pub async fn restore(&self, snapshot: &NvramSnapshot) -> Result<(), CoordinatorError> {
        let _lease = self.lease.lock().await;

        for (&id, value) in &snapshot.legacy {
            self.write_raw(id, value).await?;
        }
        for (&(sys_id, item_id, sub_id), value) in &snapshot.extended {
            self.ex_write(sys_id, item_id, sub_id, value).await?;
        }

        // Verification pass
        for (&id, expected) in &snapshot.legacy {
            let actual = self.read_raw(id).await?;
            if actual.as_deref() != Some(expected.as_slice()) {
                return Err(CoordinatorError::NvramMismatch(items::name_of(id)));
            }
        }
        for (&(sys_id, item_id, sub_id), expected) in &snapshot.extended {
            let actual = self.ex_read(sys_id, item_id, sub_id).await?;
            if actual.as_deref() != Some(expected.as_slice()) {
                return Err(CoordinatorError::NvramMismatch("EX_NV_ITEM"));
            }
        }
        Ok(())
    }

    /// Clear persistent state to the requested depth, then reset the device
    pub async fn reset(
        &self,
        depth: ResetDepth,
        flavor: ZStackFlavor,
    ) -> Result<(), CoordinatorError> {
        let _lease = self.lease.lock().await;

        let (ids, startup): (Vec<NvId>, u8) = match depth {
            ResetDepth::NetworkOnly => (
                items::network_reset_ids(flavor).to_vec(),
                items::startup_option::CLEAR_STATE,
            ),
            ResetDepth::Factory => (
                BACKUP_IDS.to_vec(),
                items::startup_option::CLEAR_STATE | items::startup_option::CLEAR_CONFIG,
            ),
        };

        for item in ids {
            if item == NvId::StartupOption {
                continue;
            }
            self.delete_item(item).await?;
        }

        if flavor.uses_extended_nv() {
            let tables = match depth {
                ResetDepth::NetworkOnly => NETWORK_RESET_EX_TABLES,
                ResetDepth::Factory => BACKUP_EX_TABLES,
            };
            for &table in tables {
                self.clear_ex_table(table).await?;
            }
        }

        self.write_item(NvId::StartupOption, &[startup]).await?;
        self.reset_device().await
    }

    /// Soft-reset the coprocessor and wait for it to come back
    pub async fn reset_device(&self) -> Result<(), CoordinatorError> {
        // Register the waiter before the request so a fast reboot is not missed
        let reset_ind = self
            .bus
            .wait_for(|_: &sys::ResetInd| true, RESET_TIMEOUT);
        self.bus
            .send(sys::ResetReq {
                reset_type: sys::RESET_TYPE_SOFT,
            })
            .await?;
        let ind = reset_ind.await?;
        tracing::info!(
            "Device reset complete (reason {}, firmware {}.{}.{})",
            ind.reason,
            ind.major,
            ind.minor,
            ind.maint
        );
        Ok(())
    }

    async fn clear_ex_table(&self, table: ExNvId) -> Result<(), CoordinatorError> {
        for sub_id in 0u16.. {
            if self
                .ex_length(items::NV_SYS_ID_ZSTACK, table.item_id(), sub_id)
                .await?
                == 0
            {
                break;
            }
            self.ex_delete(items::NV_SYS_ID_ZSTACK, table.item_id(), sub_id)
                .await?;
        }
        Ok(())
    }
}
