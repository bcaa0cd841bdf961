use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::{DEFAULT_SCAN_INTERVAL_MS, DEFAULT_SCAN_WINDOW_MS};
use crate::core::bluetooth::error::ConfigError;
use crate::core::bluetooth::types::Phy;

/// Smallest and largest scan interval/window the controller accepts, in 0.625 ms units
const MIN_SCAN_UNITS: u32 = 0x0004;
const MAX_SCAN_UNITS: u32 = 0x4000;

/// Converts milliseconds to 0.625 ms controller units
pub fn ms_to_scan_units(ms: u32) -> u32 {
    ms.saturating_mul(8) / 5
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Active scanning sends scan requests for scan response data
    pub active: bool,

    /// Scan interval in milliseconds (2.5 ..= 10240)
    pub scan_interval_ms: u32,

    /// Scan window in milliseconds, at most the interval
    pub scan_window_ms: u32,

    /// Scan on exactly this PHY. `None` scans on both 1M and Coded.
    pub phy: Option<Phy>,

    pub filter_duplicates: bool,

    /// Accepted and reported, but advertisements are not filtered on it
    pub min_rssi: Option<i8>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            active: true,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            scan_window_ms: DEFAULT_SCAN_WINDOW_MS,
            phy: None,
            filter_duplicates: true,
            min_rssi: None,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = |units: u32| (MIN_SCAN_UNITS..=MAX_SCAN_UNITS).contains(&units);
        if !in_range(ms_to_scan_units(self.scan_interval_ms)) {
            return Err(ConfigError::InvalidScanInterval(self.scan_interval_ms));
        }
        if !in_range(ms_to_scan_units(self.scan_window_ms)) {
            return Err(ConfigError::InvalidScanWindow(self.scan_window_ms));
        }
        if self.scan_window_ms > self.scan_interval_ms {
            return Err(ConfigError::WindowExceedsInterval {
                window: self.scan_window_ms,
                interval: self.scan_interval_ms,
            });
        }
        Ok(())
    }

    /// Scan interval in controller units. Only meaningful after `validate`.
    pub fn interval_units(&self) -> u16 {
        ms_to_scan_units(self.scan_interval_ms).min(MAX_SCAN_UNITS) as u16
    }

    /// Scan window in controller units. Only meaningful after `validate`.
    pub fn window_units(&self) -> u16 {
        ms_to_scan_units(self.scan_window_ms).min(MAX_SCAN_UNITS) as u16
    }

    /// The PHYs to scan on
    pub fn phys(&self) -> Vec<Phy> {
        match self.phy {
            Some(phy) => vec![phy],
            None => vec![Phy::Le1M, Phy::LeCoded],
        }
    }

    /// Legacy scan commands can only drive the 1M PHY
    pub fn needs_extended_scan(&self) -> bool {
        self.phys().contains(&Phy::LeCoded)
    }
}
