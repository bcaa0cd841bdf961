use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::{
    DEFAULT_ATT_MTU, DEFAULT_ATT_REQUEST_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS,
    DEFAULT_CONN_INTERVAL_MAX, DEFAULT_CONN_INTERVAL_MIN, DEFAULT_CONN_LATENCY,
    DEFAULT_PREFERRED_MTU, DEFAULT_SUPERVISION_TIMEOUT,
};
use crate::core::bluetooth::error::ConfigError;

/// Parameters of LE Create Connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_secs: u64,
    /// Initiator scan interval, 0.625 ms units
    pub scan_interval: u16,
    /// Initiator scan window, 0.625 ms units
    pub scan_window: u16,
    /// Connection interval bounds, 1.25 ms units
    pub interval_min: u16,
    pub interval_max: u16,
    pub max_latency: u16,
    /// 10 ms units
    pub supervision_timeout: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            scan_interval: 0x0060,
            scan_window: 0x0060,
            interval_min: DEFAULT_CONN_INTERVAL_MIN,
            interval_max: DEFAULT_CONN_INTERVAL_MAX,
            max_latency: DEFAULT_CONN_LATENCY,
            supervision_timeout: DEFAULT_SUPERVISION_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| Err(ConfigError::InvalidConnectionParameters(what.to_string()));

        if self.connect_timeout_secs == 0 {
            return invalid("connect timeout must be at least one second");
        }
        if !(0x0004..=0x4000).contains(&self.scan_interval)
            || !(0x0004..=0x4000).contains(&self.scan_window)
            || self.scan_window > self.scan_interval
        {
            return invalid("initiator scan window/interval");
        }
        if !(0x0006..=0x0C80).contains(&self.interval_min)
            || !(0x0006..=0x0C80).contains(&self.interval_max)
            || self.interval_min > self.interval_max
        {
            return invalid("connection interval");
        }
        if self.max_latency > 0x01F3 {
            return invalid("peripheral latency");
        }
        if !(0x000A..=0x0C80).contains(&self.supervision_timeout) {
            return invalid("supervision timeout");
        }
        // timeout (10 ms) must exceed (1 + latency) * interval_max (1.25 ms) * 2
        let needed = (1 + self.max_latency as u32) * self.interval_max as u32;
        if self.supervision_timeout as u32 * 4 <= needed {
            return invalid("supervision timeout too short for interval and latency");
        }
        Ok(())
    }
}

/// GATT client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    /// ATT transaction timeout
    pub request_timeout_secs: u64,
    /// MTU proposed after connecting
    pub preferred_mtu: u16,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_ATT_REQUEST_TIMEOUT_SECS,
            preferred_mtu: DEFAULT_PREFERRED_MTU,
        }
    }
}

impl GattConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidConnectionParameters(
                "ATT request timeout must be at least one second".to_string(),
            ));
        }
        if self.preferred_mtu < DEFAULT_ATT_MTU {
            return Err(ConfigError::InvalidConnectionParameters(format!(
                "ATT MTU {} below {}",
                self.preferred_mtu, DEFAULT_ATT_MTU
            )));
        }
        Ok(())
    }
}
