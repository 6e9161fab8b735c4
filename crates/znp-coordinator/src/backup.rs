//! Coordinator backup document
//!
//! A JSON file capturing everything needed to rebuild the coordinator on a
//! replacement stick: network identity and keys, plus the raw NVRAM
//! contents. Maps are ordered and byte strings hex-encoded so the format
//! is round-trip stable.

use crate::error::{BackupError, CoordinatorError};
use crate::nvram::NvramSnapshot;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use znp_protocol::types::IeeeAddr;

/// Identifies our documents among other coordinator backup formats
pub const BACKUP_FORMAT: &str = "znp-coordinator-backup";

/// Bumped on breaking schema changes
pub const BACKUP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub format: String,
    pub version: u32,
    /// Producing firmware, e.g. `2.7.1 (build 20210708)`
    pub source: String,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildBackup {
    /// Big-endian hex, no separators
    pub ieee: String,
    pub nwk: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub link_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBackup {
    pub pan_id: u16,
    /// Big-endian hex, 16 digits
    pub extended_pan_id: String,
    pub channel: u8,
    pub channel_mask: u32,
    pub nwk_update_id: u8,
    /// 32 hex digits
    pub network_key: String,
    pub tc_link_key: String,
    pub key_sequence: u8,
    pub children: Vec<ChildBackup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NvramBackup {
    /// `"<hex id>" -> "<hex bytes>"`
    pub legacy: BTreeMap<String, String>,
    /// `"<hex sys>:<hex item>:<hex sub>" -> "<hex bytes>"`
    pub extended: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDocument {
    pub metadata: BackupMetadata,
    pub network: NetworkBackup,
    pub nvram: NvramBackup,
}

fn schema_err(detail: impl Into<String>) -> CoordinatorError {
    BackupError::SchemaInvalid(detail.into()).into()
}

impl BackupDocument {
    #[allow(clippy::missing_errors_doc)]
    pub fn to_json(&self) -> Result<String, CoordinatorError> {
        serde_json::to_string_pretty(self).map_err(|e| schema_err(e.to_string()))
    }

    /// Parse and validate a backup document
    #[allow(clippy::missing_errors_doc)]
    pub fn from_json(json: &str) -> Result<Self, CoordinatorError> {
        let doc: BackupDocument =
            serde_json::from_str(json).map_err(|e| schema_err(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.metadata.format != BACKUP_FORMAT {
            return Err(schema_err(format!(
                "unknown format {:?}",
                self.metadata.format
            )));
        }
        if self.metadata.version != BACKUP_VERSION {
            return Err(schema_err(format!(
                "unsupported version {}",
                self.metadata.version
            )));
        }
        self.network_key()?;
        self.tc_link_key()?;
        self.extended_pan_id()?;
        self.nvram_snapshot()?;
        Ok(())
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn network_key(&self) -> Result<[u8; 16], CoordinatorError> {
        decode_fixed(&self.network.network_key, "network_key")
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn tc_link_key(&self) -> Result<[u8; 16], CoordinatorError> {
        decode_fixed(&self.network.tc_link_key, "tc_link_key")
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn extended_pan_id(&self) -> Result<u64, CoordinatorError> {
        let bytes: [u8; 8] = decode_fixed(&self.network.extended_pan_id, "extended_pan_id")?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Decode the NVRAM section back into raw item maps
    #[allow(clippy::missing_errors_doc)]
    pub fn nvram_snapshot(&self) -> Result<NvramSnapshot, CoordinatorError> {
        let mut snapshot = NvramSnapshot::default();

        for (key, value) in &self.nvram.legacy {
            let id = u16::from_str_radix(key, 16)
                .map_err(|_| schema_err(format!("bad legacy NV id {key:?}")))?;
            let bytes = hex::decode(value)
                .map_err(|_| schema_err(format!("bad hex for legacy NV {key:?}")))?;
            snapshot.legacy.insert(id, bytes);
        }

        for (key, value) in &self.nvram.extended {
            let mut parts = key.splitn(3, ':');
            let (sys, item, sub) = match (parts.next(), parts.next(), parts.next()) {
                (Some(sys), Some(item), Some(sub)) => (sys, item, sub),
                _ => return Err(schema_err(format!("bad extended NV key {key:?}"))),
            };
            let sys_id = u8::from_str_radix(sys, 16)
                .map_err(|_| schema_err(format!("bad sys id in {key:?}")))?;
            let item_id = u16::from_str_radix(item, 16)
                .map_err(|_| schema_err(format!("bad item id in {key:?}")))?;
            let sub_id = u16::from_str_radix(sub, 16)
                .map_err(|_| schema_err(format!("bad sub id in {key:?}")))?;
            let bytes = hex::decode(value)
                .map_err(|_| schema_err(format!("bad hex for extended NV {key:?}")))?;
            snapshot.extended.insert((sys_id, item_id, sub_id), bytes);
        }

        Ok(snapshot)
    }
}

/// Encode a raw snapshot into the document's hex maps
#[must_use]
pub fn encode_nvram(snapshot: &NvramSnapshot) -> NvramBackup {
    let mut out = NvramBackup::default();
    for (id, bytes) in &snapshot.legacy {
        out.legacy.insert(format!("{id:04x}"), hex::encode(bytes));
    }
    for ((sys_id, item_id, sub_id), bytes) in &snapshot.extended {
        out.extended.insert(
            format!("{sys_id:02x}:{item_id:04x}:{sub_id:04x}"),
            hex::encode(bytes),
        );
    }
    out
}

/// IEEE address as the backup format writes it: big-endian hex
#[must_use]
pub fn encode_ieee(ieee: IeeeAddr) -> String {
    hex::encode(ieee.0.to_be_bytes())
}

#[allow(clippy::missing_errors_doc)]
pub fn decode_ieee(text: &str) -> Result<IeeeAddr, CoordinatorError> {
    let bytes: [u8; 8] = decode_fixed(text, "ieee")?;
    Ok(IeeeAddr(u64::from_be_bytes(bytes)))
}

fn decode_fixed<const N: usize>(text: &str, field: &str) -> Result<[u8; N], CoordinatorError> {
    let bytes = hex::decode(text).map_err(|_| schema_err(format!("bad hex in {field}")))?;
    bytes
        .try_into()
        .map_err(|_| schema_err(format!("{field} must be {N} bytes")))
}
