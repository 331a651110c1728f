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

//! Configuration module.
//!
//! Handles loading and saving controller settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::constants::{defaults, SERVICE_UUID};
use crate::bluetooth::Framing;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection settings.
    pub bluetooth: BluetoothConfig,

    /// Discovery settings.
    pub discovery: DiscoveryConfig,

    /// Session transport settings.
    pub session: SessionConfig,

    /// Transient error feed settings.
    pub errors: ErrorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Sender name for outgoing messages. Uses the adapter name when unset.
    pub device_name: Option<String>,

    /// RFCOMM service both sides listen on and dial.
    pub service_uuid: Uuid,

    /// How long a listening endpoint waits for a peer.
    pub accept_timeout_secs: u64,

    /// How long a dial may take.
    pub connect_timeout_secs: u64,

    /// Go back to listening after an accepted session ends.
    pub relisten_after_session: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            service_uuid: SERVICE_UUID,
            accept_timeout_secs: defaults::ACCEPT_TIMEOUT_SECS,
            connect_timeout_secs: defaults::CONNECT_TIMEOUT_SECS,
            relisten_after_session: false,
        }
    }
}

impl BluetoothConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Length of one discovery cycle in seconds.
    pub duration_secs: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            duration_secs: defaults::DISCOVERY_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Size of the read buffer in bytes.
    pub read_buffer_size: usize,

    /// Frame delimiting on the wire.
    pub framing: Framing,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            framing: Framing::Raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    /// Pending messages kept for slow observers.
    pub feed_capacity: usize,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            feed_capacity: defaults::ERROR_FEED_CAPACITY,
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bluechat")
            .join("config.toml")
    }

    /// Load configuration from the default file or create it.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults there if missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
