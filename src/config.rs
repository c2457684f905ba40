// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Application configuration.
//!
//! Read from `config.toml` in the user's config directory. Every field is
//! optional; a missing file yields the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::bluetooth::ble_constants::DEFAULT_SCAN_TIMEOUT_SECS;

const APP_DIR: &str = "latchkey";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where `keys.json` lives. Defaults to the local data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// How long a scan for locks runs.
    pub scan_timeout_secs: u64,
    /// Bluetooth adapter name, e.g. `hci0`. Defaults to the system adapter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Whether the simulated lock stores exchanged keys without confirmation.
    pub auto_confirm_simulated: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            adapter: None,
            log_level: "info".to_string(),
            auto_confirm_simulated: true,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR))
                .context("Failed to get local data directory"),
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = Config::load(Some(&temp_dir.path().join("config.toml")))?;
        assert_eq!(config, Config::default());
        assert_eq!(config.scan_timeout(), Duration::from_secs(15));
        Ok(())
    }

    #[test]
    fn test_partial_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "scan_timeout_secs = 5\nadapter = \"hci1\"\n")?;

        let config = Config::load(Some(&path))?;
        assert_eq!(config.scan_timeout_secs, 5);
        assert_eq!(config.adapter.as_deref(), Some("hci1"));
        assert_eq!(config.log_level, "info");
        assert!(config.auto_confirm_simulated);
        Ok(())
    }

    #[test]
    fn test_save_and_reload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nested").join("config.toml");
        let config = Config {
            data_dir: Some(temp_dir.path().join("data")),
            log_level: "debug".to_string(),
            ..Config::default()
        };

        config.save(&path)?;
        assert_eq!(Config::load(Some(&path))?, config);
        assert_eq!(config.data_dir()?, temp_dir.path().join("data"));
        Ok(())
    }

    #[test]
    fn test_invalid_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "scan_timeout_secs = \"soon\"")?;
        assert!(Config::load(Some(&path)).is_err());
        Ok(())
    }
}
