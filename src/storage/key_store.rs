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

//! Persistent key storage.
//!
//! Keeps the active unlock key and the address of the last used lock in
//! `keys.json` inside the data directory.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::bluetooth::ble_constants::KEY_COUNT;
use crate::crypto::SECRET_LENGTH;
use crate::protocol::{KeyMaterial, StateStore};

const FILE_NAME: &str = "keys.json";
const FILE_VERSION: u32 = 1;

/// A stored key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKey {
    /// Key slot on the lock.
    key_number: u8,
    /// Base64 encoded shared secret.
    secret: String,
    /// When the key was confirmed.
    confirmed: DateTime<Utc>,
}

/// Key file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    key: Option<StoredKey>,
    last_endpoint: Option<String>,
    updated: DateTime<Utc>,
}

impl Default for KeyFile {
    fn default() -> Self {
        Self {
            version: FILE_VERSION,
            key: None,
            last_endpoint: None,
            updated: Utc::now(),
        }
    }
}

/// File backed [`StateStore`].
pub struct KeyStore {
    file_path: PathBuf,
    file: KeyFile,
}

impl KeyStore {
    /// Open the store in `data_dir`, creating the directory if needed.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let file_path = data_dir.join(FILE_NAME);

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let file = Self::load(&file_path)?;
        info!(
            "Loaded key store from {:?} (key: {}, lock: {})",
            file_path,
            file.key.is_some(),
            file.last_endpoint.as_deref().unwrap_or("none")
        );

        Ok(Self { file_path, file })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// When the file was last written.
    pub fn updated(&self) -> DateTime<Utc> {
        self.file.updated
    }

    /// When the active key was confirmed.
    pub fn key_confirmed(&self) -> Option<DateTime<Utc>> {
        self.file.key.as_ref().map(|k| k.confirmed)
    }

    /// Forget the active key.
    pub fn clear_key(&mut self) -> Result<()> {
        if self.file.key.take().is_some() {
            info!("Active key removed");
        }
        self.save()
    }

    /// Forget the last used lock.
    pub fn clear_endpoint(&mut self) -> Result<()> {
        if self.file.last_endpoint.take().is_some() {
            info!("Lock address removed");
        }
        self.save()
    }

    fn load(path: &Path) -> Result<KeyFile> {
        if !path.exists() {
            debug!("Key file doesn't exist, starting empty");
            return Ok(KeyFile::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let file: KeyFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", FILE_NAME))?;

        if file.version != FILE_VERSION {
            bail!(
                "Unsupported {} version {} (expected {})",
                FILE_NAME,
                file.version,
                FILE_VERSION
            );
        }
        if let Some(key) = &file.key {
            decode_key(key)?;
        }

        Ok(file)
    }

    fn save(&mut self) -> Result<()> {
        self.file.updated = Utc::now();

        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&self.file)?;
        std::fs::write(&self.file_path, content)
            .with_context(|| format!("Failed to write {:?}", self.file_path))?;

        debug!("Saved key store to {:?}", self.file_path);
        Ok(())
    }
}

fn decode_key(stored: &StoredKey) -> Result<KeyMaterial> {
    if stored.key_number >= KEY_COUNT {
        bail!("Stored key number {} is out of range", stored.key_number);
    }

    let bytes = BASE64
        .decode(&stored.secret)
        .context("Stored secret is not valid base64")?;
    let secret: [u8; SECRET_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        anyhow::anyhow!(
            "Stored secret has {} bytes, expected {}",
            bytes.len(),
            SECRET_LENGTH
        )
    })?;

    Ok(KeyMaterial {
        key_number: stored.key_number,
        secret,
    })
}

impl StateStore for KeyStore {
    fn key(&self) -> Option<KeyMaterial> {
        let stored = self.file.key.as_ref()?;
        match decode_key(stored) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Ignoring stored key: {:#}", e);
                None
            }
        }
    }

    fn endpoint(&self) -> Option<String> {
        self.file.last_endpoint.clone()
    }

    fn store_key(&mut self, key: &KeyMaterial) -> Result<()> {
        self.file.key = Some(StoredKey {
            key_number: key.key_number,
            secret: BASE64.encode(key.secret),
            confirmed: Utc::now(),
        });
        info!("Stored key {}", key.key_number);
        self.save()
    }

    fn store_endpoint(&mut self, address: &str) -> Result<()> {
        self.file.last_endpoint = Some(address.to_string());
        self.save()
    }
}
