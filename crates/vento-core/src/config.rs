//! Updater configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::version::ControllerFamily;

fn default_username() -> String {
    crate::uploader::DEFAULT_USERNAME.to_string()
}

fn default_password() -> String {
    crate::uploader::DEFAULT_PASSWORD.to_string()
}

/// One managed device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device host, `name-or-ip` or `name-or-ip:port`.
    pub host: String,
    /// Controller family, decides which vendor feed is polled.
    pub family: ControllerFamily,
    /// Web UI credentials, factory default unless changed on the device.
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
}

/// Configuration for the updater.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Directory holding firmware records and downloaded binaries.
    pub store_dir: String,
    /// Seconds between scheduled vendor checks. Zero means the built-in
    /// weekly default.
    #[serde(default)]
    pub check_interval_secs: u64,
    /// Devices to manage.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl UpdaterConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: UpdaterConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn check_interval(&self) -> std::time::Duration {
        if self.check_interval_secs == 0 {
            crate::checker::CheckerConfig::default().check_interval
        } else {
            std::time::Duration::from_secs(self.check_interval_secs)
        }
    }
}
