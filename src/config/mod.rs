pub mod connection_config;
pub mod scan_config;
pub mod workflow_config;

use std::path::Path;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::constants::{DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_TRANSPORT};
use crate::utils::ensure_directory_exists;

pub use connection_config::{ConnectionConfig, GattConfig};
pub use scan_config::ScanConfig;
pub use workflow_config::{RetryPolicy, WorkflowConfig};

/// Where the controller is and how long to wait for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// `tcp-client:<host>:<port>`
    pub transport: String,
    pub command_timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            transport: DEFAULT_TRANSPORT.to_string(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: HostConfig,
    pub scan: ScanConfig,
    pub connection: ConnectionConfig,
    pub gatt: GattConfig,
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    /// Loads the config from a JSON file. A missing file yields the defaults.
    pub async fn load_config(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file not found at {:?}, using default.", path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("Invalid config file {:?}", path))?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// Saves the config as pretty-printed JSON, creating the parent directory
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_directory_exists(dir).await?;
        }

        let config_json = match serde_json::to_string_pretty(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;
        info!("Config saved to {:?}.", path);
        Ok(())
    }

    /// Checks every section
    pub fn validate(&self) -> Result<()> {
        self.scan.validate().context("Invalid scan settings")?;
        self.connection
            .validate()
            .context("Invalid connection settings")?;
        self.gatt.validate().context("Invalid GATT settings")?;
        Ok(())
    }
}
