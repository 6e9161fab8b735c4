//! NVRAM item catalogues
//!
//! Legacy OSAL ids are the `ZCD_NV_*` constants shared by every Z-Stack
//! release; the extended (sys/item/sub) ids exist only on 3.x images where
//! the large tables moved out of the legacy address space.

use crate::version::ZStackFlavor;

/// Legacy OSAL NV item ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum NvId {
    ExtAddr = 0x0001,
    BootCounter = 0x0002,
    StartupOption = 0x0003,
    StartDelay = 0x0004,
    Nib = 0x0021,
    DeviceList = 0x0022,
    AddrMgr = 0x0023,
    PollRate = 0x0024,
    StackProfile = 0x002A,
    ExtendedPanId = 0x002D,
    NwkActiveKeyInfo = 0x003A,
    NwkAlternKeyInfo = 0x003B,
    NwkParentInfo = 0x003F,
    BindingTable = 0x0041,
    GroupTable = 0x0042,
    ApsFrameRetries = 0x0043,
    ApsUseExtPanId = 0x0047,
    ApsLinkKeyTable = 0x004C,
    ConcentratorEnable = 0x0032,
    ConcentratorDiscovery = 0x0033,
    ConcentratorRadius = 0x0034,
    SecurityLevel = 0x0061,
    PrecfgKey = 0x0062,
    PrecfgKeysEnable = 0x0063,
    SecurityMode = 0x0064,
    UseDefaultTclk = 0x006D,
    TrustCenterAddr = 0x0071,
    NwkKey = 0x0082,
    PanId = 0x0083,
    Chanlist = 0x0084,
    ScanDuration = 0x0086,
    LogicalType = 0x0087,
    NwkMgrAddr = 0x0089,
    ZdoDirectCb = 0x008F,
    /// TCLK seed on 3.x, first TCLK table entry on 1.2
    TclkSeed = 0x0101,
    ApsLinkKeyDataStart = 0x0201,
    /// Marker we write after configuring a 3.x image
    HasConfiguredZStack3 = 0x0060,
    /// Marker we write after configuring a 1.2 image
    HasConfiguredZStack1 = 0x0F00,
}

impl NvId {
    #[must_use]
    pub fn id(&self) -> u16 {
        *self as u16
    }

    #[must_use]
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x0001 => Some(NvId::ExtAddr),
            0x0002 => Some(NvId::BootCounter),
            0x0003 => Some(NvId::StartupOption),
            0x0004 => Some(NvId::StartDelay),
            0x0021 => Some(NvId::Nib),
            0x0022 => Some(NvId::DeviceList),
            0x0023 => Some(NvId::AddrMgr),
            0x0024 => Some(NvId::PollRate),
            0x002A => Some(NvId::StackProfile),
            0x002D => Some(NvId::ExtendedPanId),
            0x003A => Some(NvId::NwkActiveKeyInfo),
            0x003B => Some(NvId::NwkAlternKeyInfo),
            0x003F => Some(NvId::NwkParentInfo),
            0x0041 => Some(NvId::BindingTable),
            0x0042 => Some(NvId::GroupTable),
            0x0043 => Some(NvId::ApsFrameRetries),
            0x0047 => Some(NvId::ApsUseExtPanId),
            0x004C => Some(NvId::ApsLinkKeyTable),
            0x0032 => Some(NvId::ConcentratorEnable),
            0x0033 => Some(NvId::ConcentratorDiscovery),
            0x0034 => Some(NvId::ConcentratorRadius),
            0x0061 => Some(NvId::SecurityLevel),
            0x0062 => Some(NvId::PrecfgKey),
            0x0063 => Some(NvId::PrecfgKeysEnable),
            0x0064 => Some(NvId::SecurityMode),
            0x006D => Some(NvId::UseDefaultTclk),
            0x0071 => Some(NvId::TrustCenterAddr),
            0x0082 => Some(NvId::NwkKey),
            0x0083 => Some(NvId::PanId),
            0x0084 => Some(NvId::Chanlist),
            0x0086 => Some(NvId::ScanDuration),
            0x0087 => Some(NvId::LogicalType),
            0x0089 => Some(NvId::NwkMgrAddr),
            0x008F => Some(NvId::ZdoDirectCb),
            0x0101 => Some(NvId::TclkSeed),
            0x0201 => Some(NvId::ApsLinkKeyDataStart),
            0x0060 => Some(NvId::HasConfiguredZStack3),
            0x0F00 => Some(NvId::HasConfiguredZStack1),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            NvId::ExtAddr => "EXTADDR",
            NvId::BootCounter => "BOOTCOUNTER",
            NvId::StartupOption => "STARTUP_OPTION",
            NvId::StartDelay => "START_DELAY",
            NvId::Nib => "NIB",
            NvId::DeviceList => "DEVICE_LIST",
            NvId::AddrMgr => "ADDRMGR",
            NvId::PollRate => "POLL_RATE",
            NvId::StackProfile => "STACK_PROFILE",
            NvId::ExtendedPanId => "EXTENDED_PAN_ID",
            NvId::NwkActiveKeyInfo => "NWK_ACTIVE_KEY_INFO",
            NvId::NwkAlternKeyInfo => "NWK_ALTERN_KEY_INFO",
            NvId::NwkParentInfo => "NWK_PARENT_INFO",
            NvId::BindingTable => "BINDING_TABLE",
            NvId::GroupTable => "GROUP_TABLE",
            NvId::ApsFrameRetries => "APS_FRAME_RETRIES",
            NvId::ApsUseExtPanId => "APS_USE_EXT_PANID",
            NvId::ApsLinkKeyTable => "APS_LINK_KEY_TABLE",
            NvId::ConcentratorEnable => "CONCENTRATOR_ENABLE",
            NvId::ConcentratorDiscovery => "CONCENTRATOR_DISCOVERY",
            NvId::ConcentratorRadius => "CONCENTRATOR_RADIUS",
            NvId::SecurityLevel => "SECURITY_LEVEL",
            NvId::PrecfgKey => "PRECFGKEY",
            NvId::PrecfgKeysEnable => "PRECFGKEYS_ENABLE",
            NvId::SecurityMode => "SECURITY_MODE",
            NvId::UseDefaultTclk => "USE_DEFAULT_TCLK",
            NvId::TrustCenterAddr => "TRUSTCENTER_ADDR",
            NvId::NwkKey => "NWKKEY",
            NvId::PanId => "PANID",
            NvId::Chanlist => "CHANLIST",
            NvId::ScanDuration => "SCAN_DURATION",
            NvId::LogicalType => "LOGICAL_TYPE",
            NvId::NwkMgrAddr => "NWKMGR_ADDR",
            NvId::ZdoDirectCb => "ZDO_DIRECT_CB",
            NvId::TclkSeed => "TCLK_SEED",
            NvId::ApsLinkKeyDataStart => "APS_LINK_KEY_DATA_START",
            NvId::HasConfiguredZStack3 => "HAS_CONFIGURED_ZSTACK3",
            NvId::HasConfiguredZStack1 => "HAS_CONFIGURED_ZSTACK1",
        }
    }
}

/// Best-effort display name for a raw legacy id
#[must_use]
pub fn name_of(id: u16) -> &'static str {
    NvId::from_id(id).map_or("NV_ITEM", |item| item.name())
}

/// `ZCD_NV_STARTUP_OPTION` bits
pub mod startup_option {
    pub const CLEAR_CONFIG: u8 = 0x01;
    pub const CLEAR_STATE: u8 = 0x02;
}

/// Extended NV system id owning the Z-Stack tables
pub const NV_SYS_ID_ZSTACK: u8 = 1;

/// Extended OSAL NV item ids (3.x only), each a table indexed by sub id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum ExNvId {
    AddrMgr = 0x0001,
    BindingTable = 0x0002,
    DeviceList = 0x0003,
    TclkTable = 0x0004,
    TclkIcTable = 0x0005,
    ApsKeyDataTable = 0x0006,
    NwkSecMaterialTable = 0x0007,
}

impl ExNvId {
    #[must_use]
    pub fn item_id(&self) -> u16 {
        *self as u16
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ExNvId::AddrMgr => "EX_ADDRMGR",
            ExNvId::BindingTable => "EX_BINDING_TABLE",
            ExNvId::DeviceList => "EX_DEVICE_LIST",
            ExNvId::TclkTable => "EX_TCLK_TABLE",
            ExNvId::TclkIcTable => "EX_TCLK_IC_TABLE",
            ExNvId::ApsKeyDataTable => "EX_APS_KEY_DATA_TABLE",
            ExNvId::NwkSecMaterialTable => "EX_NWK_SEC_MATERIAL_TABLE",
        }
    }
}

/// Every legacy item a backup walks, in id order
pub const BACKUP_IDS: &[NvId] = &[
    NvId::ExtAddr,
    NvId::StartupOption,
    NvId::Nib,
    NvId::DeviceList,
    NvId::AddrMgr,
    NvId::StackProfile,
    NvId::ExtendedPanId,
    NvId::NwkActiveKeyInfo,
    NvId::NwkAlternKeyInfo,
    NvId::NwkParentInfo,
    NvId::BindingTable,
    NvId::GroupTable,
    NvId::ApsUseExtPanId,
    NvId::ApsLinkKeyTable,
    NvId::SecurityLevel,
    NvId::PrecfgKey,
    NvId::PrecfgKeysEnable,
    NvId::UseDefaultTclk,
    NvId::TrustCenterAddr,
    NvId::NwkKey,
    NvId::PanId,
    NvId::Chanlist,
    NvId::LogicalType,
    NvId::NwkMgrAddr,
    NvId::ZdoDirectCb,
    NvId::TclkSeed,
    NvId::ApsLinkKeyDataStart,
    NvId::HasConfiguredZStack3,
    NvId::HasConfiguredZStack1,
];

/// Extended tables a 3.x backup walks
pub const BACKUP_EX_TABLES: &[ExNvId] = &[
    ExNvId::AddrMgr,
    ExNvId::BindingTable,
    ExNvId::DeviceList,
    ExNvId::TclkTable,
    ExNvId::TclkIcTable,
    ExNvId::ApsKeyDataTable,
    ExNvId::NwkSecMaterialTable,
];

/// Items cleared by a network-only reset
///
/// The composition is firmware dependent and deliberately enumerated per
/// flavour rather than derived; these lists mirror what each release
/// actually persists for a formed network.
#[must_use]
pub fn network_reset_ids(flavor: ZStackFlavor) -> &'static [NvId] {
    const ZSTACK_12: &[NvId] = &[
        NvId::Nib,
        NvId::DeviceList,
        NvId::AddrMgr,
        NvId::ExtendedPanId,
        NvId::NwkActiveKeyInfo,
        NvId::NwkAlternKeyInfo,
        NvId::BindingTable,
        NvId::ApsUseExtPanId,
        NvId::ApsLinkKeyTable,
        NvId::ApsLinkKeyDataStart,
        NvId::PrecfgKey,
        NvId::NwkKey,
        NvId::PanId,
        NvId::TclkSeed,
        NvId::HasConfiguredZStack1,
    ];
    const ZSTACK_30: &[NvId] = &[
        NvId::Nib,
        NvId::DeviceList,
        NvId::AddrMgr,
        NvId::ExtendedPanId,
        NvId::NwkActiveKeyInfo,
        NvId::NwkAlternKeyInfo,
        NvId::NwkParentInfo,
        NvId::BindingTable,
        NvId::ApsUseExtPanId,
        NvId::ApsLinkKeyTable,
        NvId::ApsLinkKeyDataStart,
        NvId::PrecfgKey,
        NvId::NwkKey,
        NvId::PanId,
        NvId::TclkSeed,
        NvId::HasConfiguredZStack3,
    ];
    const ZSTACK_3X: &[NvId] = &[
        NvId::Nib,
        NvId::ExtendedPanId,
        NvId::NwkActiveKeyInfo,
        NvId::NwkAlternKeyInfo,
        NvId::NwkParentInfo,
        NvId::ApsUseExtPanId,
        NvId::PrecfgKey,
        NvId::NwkKey,
        NvId::PanId,
        NvId::TclkSeed,
        NvId::HasConfiguredZStack3,
    ];

    match flavor {
        ZStackFlavor::ZStack12 => ZSTACK_12,
        ZStackFlavor::ZStack30 => ZSTACK_30,
        ZStackFlavor::ZStack3x => ZSTACK_3X,
    }
}

/// Extended tables cleared by a network-only reset on 3.x
pub const NETWORK_RESET_EX_TABLES: &[ExNvId] = &[
    ExNvId::AddrMgr,
    ExNvId::BindingTable,
    ExNvId::DeviceList,
    ExNvId::TclkTable,
    ExNvId::ApsKeyDataTable,
    ExNvId::NwkSecMaterialTable,
];
