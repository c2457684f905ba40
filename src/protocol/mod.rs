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

//! Unlock and key exchange protocols.

pub mod machine;
pub mod state;

use anyhow::Result;

pub use machine::ProtocolMachine;
pub use state::{KeyExchangeStep, KeyMaterial, LinkStep, State, UnlockStep};

/// Persistent client state, read when the machine is created and written
/// only at task boundaries.
pub trait StateStore: Send {
    /// Active key, if one was committed.
    fn key(&self) -> Option<KeyMaterial>;

    /// Address of the last used lock.
    fn endpoint(&self) -> Option<String>;

    fn store_key(&mut self, key: &KeyMaterial) -> Result<()>;

    fn store_endpoint(&mut self, address: &str) -> Result<()>;
}

/// Volatile store, used in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    pub key: Option<KeyMaterial>,
    pub endpoint: Option<String>,
}

impl StateStore for MemoryStore {
    fn key(&self) -> Option<KeyMaterial> {
        self.key.clone()
    }

    fn endpoint(&self) -> Option<String> {
        self.endpoint.clone()
    }

    fn store_key(&mut self, key: &KeyMaterial) -> Result<()> {
        self.key = Some(key.clone());
        Ok(())
    }

    fn store_endpoint(&mut self, address: &str) -> Result<()> {
        self.endpoint = Some(address.to_string());
        Ok(())
    }
}
