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

//! In-process lock simulator.
//!
//! [`SimulatedLock`] plays the lock side of both protocols and
//! [`SimulatedTransport`] connects it to the event queue, so the whole client
//! can be exercised without a radio. Completion events are posted
//! synchronously, in the order a real lock produces them. In particular the
//! nonce indication is delivered before the nonce subscription acknowledgment.

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ble_constants::KEY_COUNT;
use super::reassembler::{split_value, Chunk, MessageReassembler, ReassemblyError, CHUNK_LENGTH};
use super::transport::{Channel, DiscoveredLock, Transport, TransportError};
use crate::crypto::{hmac_sha512_256, Checksum, EcdhKeypair, NONCE_LENGTH, SECRET_LENGTH};
use crate::events::{Event, EventSender};

/// Address the simulated lock answers on.
pub const SIMULATED_ADDRESS: &str = "5A:1D:10:C4:00:01";

/// The locks a scan finds in simulated mode.
pub fn scan() -> Vec<DiscoveredLock> {
    vec![DiscoveredLock {
        address: SIMULATED_ADDRESS.to_string(),
        name: Some("Simulated lock".to_string()),
        rssi: Some(-40),
    }]
}

/// Rejections by the simulated lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("key slot {0} does not exist")]
    InvalidSlot(u8),

    #[error("key slot {0} is empty")]
    EmptySlot(u8),

    #[error("no nonce was issued")]
    NoNonce,

    #[error("HMAC verification failed")]
    BadHmac,

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
}

/// Lock side of the unlock and key exchange protocols.
#[derive(Debug)]
pub struct SimulatedLock {
    keys: [Option<[u8; SECRET_LENGTH]>; KEY_COUNT as usize],
    nonce: Option<[u8; NONCE_LENGTH]>,
    unlock: Option<MessageReassembler>,
    cfg_in: Option<MessageReassembler>,
    pending: Option<(u8, [u8; SECRET_LENGTH])>,
    auto_confirm: bool,
    unlock_count: u32,
}

impl SimulatedLock {
    pub fn new(auto_confirm: bool) -> Self {
        Self {
            keys: [None; KEY_COUNT as usize],
            nonce: None,
            unlock: None,
            cfg_in: None,
            pending: None,
            auto_confirm,
            unlock_count: 0,
        }
    }

    /// Install a key directly, as if it had been exchanged earlier.
    pub fn install_key(&mut self, slot: u8, secret: [u8; SECRET_LENGTH]) -> Result<(), LockError> {
        *self.slot_mut(slot)? = Some(secret);
        Ok(())
    }

    pub fn key(&self, slot: u8) -> Option<[u8; SECRET_LENGTH]> {
        self.keys.get(usize::from(slot)).copied().flatten()
    }

    /// Number of successful unlocks.
    pub fn unlock_count(&self) -> u32 {
        self.unlock_count
    }

    /// Checksum of the derived key still awaiting confirmation on the lock.
    pub fn pending_checksum(&self) -> Option<Checksum> {
        self.pending
            .as_ref()
            .map(|(_, secret)| Checksum::of_secret(secret))
    }

    /// Confirm the derived key on the lock side and store it in its slot.
    pub fn confirm_pending(&mut self) -> Result<Option<u8>, LockError> {
        let Some((slot, secret)) = self.pending.take() else {
            return Ok(None);
        };
        self.install_key(slot, secret)?;
        info!("Simulated lock stored key {}", slot);
        Ok(Some(slot))
    }

    /// Issue a fresh single-use nonce.
    pub fn issue_nonce(&mut self) -> [u8; NONCE_LENGTH] {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        self.nonce = Some(nonce);
        self.unlock = None;
        nonce
    }

    /// Accept one unlock chunk. Returns `true` once the door opened.
    pub fn receive_unlock(&mut self, chunk: &[u8]) -> Result<bool, LockError> {
        if chunk.len() != CHUNK_LENGTH {
            return Err(ReassemblyError::InvalidLength(chunk.len()).into());
        }
        let slot = chunk[0];
        let secret = self.key(slot).ok_or_else(|| {
            if usize::from(slot) < self.keys.len() {
                LockError::EmptySlot(slot)
            } else {
                LockError::InvalidSlot(slot)
            }
        })?;

        let reassembler = self
            .unlock
            .get_or_insert_with(|| MessageReassembler::new(slot));
        let Some(received) = reassembler.process_chunk(chunk)? else {
            return Ok(false);
        };
        self.unlock = None;

        let nonce = self.nonce.take().ok_or(LockError::NoNonce)?;
        let expected = hmac_sha512_256(&secret, &nonce).map_err(|_| LockError::BadHmac)?;
        if received != expected {
            warn!("Simulated lock rejected HMAC for key {}", slot);
            return Err(LockError::BadHmac);
        }

        self.unlock_count += 1;
        info!("Simulated lock opened with key {}", slot);
        Ok(true)
    }

    /// Accept one client public key chunk. Once both halves arrived, returns
    /// the two chunks of the lock's own public key.
    pub fn receive_cfg_in(&mut self, chunk: &[u8]) -> Result<Option<[Chunk; 2]>, LockError> {
        if chunk.len() != CHUNK_LENGTH {
            return Err(ReassemblyError::InvalidLength(chunk.len()).into());
        }
        let slot = chunk[0];
        self.slot_mut(slot)?;

        if chunk[1] == 0 {
            self.cfg_in = Some(MessageReassembler::new(slot));
        }
        let reassembler = self
            .cfg_in
            .get_or_insert_with(|| MessageReassembler::new(slot));
        let Some(client_public) = reassembler.process_chunk(chunk)? else {
            return Ok(None);
        };
        self.cfg_in = None;

        let server = EcdhKeypair::generate(&mut OsRng);
        let shared = server.shared_secret(&client_public);
        debug!(
            "Simulated lock derived key {}, checksum {}",
            slot,
            Checksum::of_secret(&shared)
        );
        self.pending = Some((slot, shared));
        if self.auto_confirm {
            self.confirm_pending()?;
        }

        Ok(Some(split_value(&server.public_bytes(), slot)))
    }

    fn slot_mut(&mut self, slot: u8) -> Result<&mut Option<[u8; SECRET_LENGTH]>, LockError> {
        self.keys
            .get_mut(usize::from(slot))
            .ok_or(LockError::InvalidSlot(slot))
    }
}

/// [`Transport`] backed by a [`SimulatedLock`].
pub struct SimulatedTransport {
    lock: Arc<Mutex<SimulatedLock>>,
    events: EventSender,
    enabled: bool,
    connected: bool,
    resolved: bool,
    subscriptions: HashSet<Channel>,
}

impl SimulatedTransport {
    pub fn new(lock: Arc<Mutex<SimulatedLock>>, events: EventSender) -> Self {
        Self {
            lock,
            events,
            enabled: true,
            connected: false,
            resolved: false,
            subscriptions: HashSet::new(),
        }
    }

    /// Start with the radio powered off.
    pub fn powered_off(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn lock(&self) -> Arc<Mutex<SimulatedLock>> {
        self.lock.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Simulate the lock dropping the link.
    pub fn drop_link(&mut self) {
        if self.connected {
            self.reset();
            self.post(Event::Disconnected);
        }
    }

    fn post(&self, event: Event) {
        debug!("Simulated transport -> {:?}", event);
        let _ = self.events.send(event);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn ensure_resolved(&self, channel: Channel) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if self.resolved {
            Ok(())
        } else {
            Err(TransportError::ChannelUnavailable(channel))
        }
    }

    fn reset(&mut self) {
        self.connected = false;
        self.resolved = false;
        self.subscriptions.clear();
    }
}

impl Transport for SimulatedTransport {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn request_enable(&mut self) -> Result<(), TransportError> {
        self.enabled = true;
        self.post(Event::BluetoothEnabled);
        Ok(())
    }

    fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        if !self.enabled {
            return Err(TransportError::Backend("radio is off".into()));
        }
        if address.eq_ignore_ascii_case(SIMULATED_ADDRESS) {
            self.connected = true;
            self.post(Event::Connected);
        } else {
            warn!("No simulated lock at {}", address);
            self.post(Event::Failure);
        }
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.resolved = true;
        self.post(Event::ServicesDiscovered);
        Ok(())
    }

    fn has_service(&self) -> bool {
        self.resolved
    }

    fn has_channel(&self, _channel: Channel) -> bool {
        self.resolved
    }

    fn subscribe(&mut self, channel: Channel) -> Result<(), TransportError> {
        self.ensure_resolved(channel)?;
        match channel {
            Channel::Nonce => {
                self.subscriptions.insert(channel);
                let nonce = self.lock.lock().issue_nonce();
                self.post(Event::NotificationReceived(channel, nonce.to_vec()));
                self.post(Event::SubscribeAck(channel));
            }
            Channel::CfgOut => {
                self.subscriptions.insert(channel);
                self.post(Event::SubscribeAck(channel));
            }
            Channel::Unlock | Channel::CfgIn => {
                return Err(TransportError::ChannelUnavailable(channel))
            }
        }
        Ok(())
    }

    fn write(&mut self, channel: Channel, value: &[u8]) -> Result<(), TransportError> {
        self.ensure_resolved(channel)?;
        match channel {
            Channel::Unlock => {
                let result = self.lock.lock().receive_unlock(value);
                match result {
                    Ok(_) => self.post(Event::WriteAck(channel)),
                    Err(e) => {
                        warn!("Simulated lock refused unlock write: {}", e);
                        self.post(Event::Failure);
                    }
                }
            }
            Channel::CfgIn => {
                let result = self.lock.lock().receive_cfg_in(value);
                match result {
                    Ok(reply) => {
                        self.post(Event::WriteAck(channel));
                        if let Some(chunks) = reply {
                            if self.subscriptions.contains(&Channel::CfgOut) {
                                for chunk in chunks {
                                    self.post(Event::NotificationReceived(
                                        Channel::CfgOut,
                                        chunk.to_vec(),
                                    ));
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Simulated lock refused key write: {}", e);
                        self.post(Event::Failure);
                    }
                }
            }
            Channel::Nonce | Channel::CfgOut => {
                return Err(TransportError::ChannelUnavailable(channel))
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.connected {
            debug!("Simulated link closed");
        }
        self.reset();
    }
}
