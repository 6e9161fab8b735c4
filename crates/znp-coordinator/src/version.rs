//! Firmware version probing and Z-Stack flavour classification

use znp_protocol::cmd::sys;

/// Z-Stack release families with observable protocol differences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZStackFlavor {
    /// Z-Stack Home 1.2 (CC2531): legacy NV layout, no BDB
    ZStack12,
    /// Z-Stack 3.0 (CC2531/CC2530): BDB commissioning, legacy NV layout
    ZStack30,
    /// Z-Stack 3.x on CC26x2/CC13x2: extended NV tables
    ZStack3x,
}

impl ZStackFlavor {
    /// Whether device/key tables live in the extended (sys/item/sub) NV layout
    #[must_use]
    pub fn uses_extended_nv(&self) -> bool {
        matches!(self, ZStackFlavor::ZStack3x)
    }

    /// Whether network formation goes through BDB commissioning
    #[must_use]
    pub fn uses_bdb(&self) -> bool {
        !matches!(self, ZStackFlavor::ZStack12)
    }

    /// Conservative sizing of the coprocessor TX queue
    #[must_use]
    pub fn default_concurrency(&self) -> usize {
        match self {
            ZStackFlavor::ZStack12 => 6,
            ZStackFlavor::ZStack30 | ZStackFlavor::ZStack3x => 16,
        }
    }
}

/// Parsed `SYS.VERSION` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub transport_rev: u8,
    pub product: u8,
    pub major: u8,
    pub minor: u8,
    pub maint: u8,
    pub revision: Option<u32>,
}

impl FirmwareVersion {
    /// Classify the protocol flavour this image speaks
    ///
    /// 3.x images report a build revision dword; older images stop at the
    /// maintenance byte, and 1.2 reports itself as 2.6.x.
    #[must_use]
    pub fn flavor(&self) -> ZStackFlavor {
        if self.revision.is_some() {
            ZStackFlavor::ZStack3x
        } else if self.minor >= 7 {
            ZStackFlavor::ZStack30
        } else {
            ZStackFlavor::ZStack12
        }
    }
}

impl From<&sys::VersionRsp> for FirmwareVersion {
    fn from(rsp: &sys::VersionRsp) -> Self {
        Self {
            transport_rev: rsp.transport_rev,
            product: rsp.product,
            major: rsp.major,
            minor: rsp.minor,
            maint: rsp.maint,
            revision: rsp.revision,
        }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.maint)?;
        if let Some(revision) = self.revision {
            write!(f, " (build {revision})")?;
        }
        Ok(())
    }
}
