//! Driver configuration

use std::time::Duration;
use znp_protocol::transport::SerialConfig;
use znp_protocol::{DEFAULT_ARSP_TIMEOUT, DEFAULT_SREQ_TIMEOUT};

/// Radio TX power bounds; individual chips support a subset of this range
pub const TX_POWER_MIN: i8 = -22;
pub const TX_POWER_MAX: i8 = 19;

/// On-board LED behaviour, mapped onto `UTIL.LED_CONTROL` modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedMode {
    Off,
    On,
    Blink,
    Flash,
    Toggle,
}

impl LedMode {
    #[must_use]
    pub fn mode_byte(&self) -> u8 {
        match self {
            LedMode::Off => 0,
            LedMode::On => 1,
            LedMode::Blink => 2,
            LedMode::Flash => 4,
            LedMode::Toggle => 5,
        }
    }
}

/// Coordinator driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub serial: SerialConfig,
    /// Radio power in dBm; `None` keeps the firmware default
    pub tx_power: Option<i8>,
    pub led_mode: Option<LedMode>,
    pub sreq_timeout: Duration,
    /// Deadline for AREQ callbacks answering a request
    pub arsp_timeout: Duration,
    /// Interval for the SYS.PING watchdog; `None` disables it
    pub watchdog_interval: Option<Duration>,
    pub auto_reconnect_retry_delay: Duration,
    /// Concurrent outgoing data requests; `None` sizes from the firmware
    pub max_concurrent_requests: Option<usize>,
}

impl DriverConfig {
    #[must_use]
    pub fn new(serial_path: impl Into<String>) -> Self {
        Self {
            serial: SerialConfig::new(serial_path),
            tx_power: None,
            led_mode: None,
            sreq_timeout: DEFAULT_SREQ_TIMEOUT,
            arsp_timeout: DEFAULT_ARSP_TIMEOUT,
            watchdog_interval: Some(Duration::from_secs(30)),
            auto_reconnect_retry_delay: Duration::from_secs(5),
            max_concurrent_requests: None,
        }
    }
}
