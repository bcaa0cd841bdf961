use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::DEFAULT_SCAN_TIMEOUT_SECS;

/// What to do when connecting or discovery fails in a way a reconnect may cure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Fail on the first error
    #[default]
    None,
    /// Try up to `attempts` times in total, pausing `delay_ms` between tries
    Bounded { attempts: u32, delay_ms: u64 },
}

impl RetryPolicy {
    /// Total number of attempts, at least one
    pub fn attempts(&self) -> u32 {
        match self {
            RetryPolicy::None => 1,
            RetryPolicy::Bounded { attempts, .. } => (*attempts).max(1),
        }
    }

    pub fn delay(&self) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Bounded { delay_ms, .. } => Duration::from_millis(*delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// How long to wait for the first advertisement
    pub scan_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            retry: RetryPolicy::None,
        }
    }
}
