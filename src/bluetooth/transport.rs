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

//! Transport abstraction between the protocol state machine and the radio.
//!
//! Every request method only *submits* the request and returns. Completion is
//! reported later as an [`Event`](crate::events::Event) on the event queue:
//!
//! | Request | Completion events |
//! |---|---|
//! | `request_enable` | `BluetoothEnabled` / `Failure` |
//! | `connect` | `Connected` / `Failure` |
//! | `discover_services` | `ServicesDiscovered` / `Failure` |
//! | `subscribe` | `SubscribeAck(channel)` / `Failure`, then `NotificationReceived` |
//! | `write` | `WriteAck(channel)` / `Failure` |
//!
//! `Disconnected` may arrive at any time while connected. Implementations
//! allow one outstanding request per channel; the state machine never issues
//! more.

use std::fmt;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::ble_constants::{CFG_IN_UUID, CFG_OUT_UUID, NONCE_UUID, UNLOCK_UUID};

/// The four characteristics of the lock service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Nonce indications from the lock.
    Nonce,
    /// HMAC halves written to the lock.
    Unlock,
    /// Client public key halves written to the lock.
    CfgIn,
    /// Server public key halves indicated by the lock.
    CfgOut,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Nonce,
        Channel::Unlock,
        Channel::CfgIn,
        Channel::CfgOut,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Channel::Nonce => NONCE_UUID,
            Channel::Unlock => UNLOCK_UUID,
            Channel::CfgIn => CFG_IN_UUID,
            Channel::CfgOut => CFG_OUT_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Nonce => "nonce",
            Channel::Unlock => "unlock",
            Channel::CfgIn => "cfg-in",
            Channel::CfgOut => "cfg-out",
        };
        f.write_str(name)
    }
}

/// A lock found by scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLock {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl fmt::Display for DiscoveredLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        if let Some(name) = &self.name {
            write!(f, " ({})", name)?;
        }
        if let Some(rssi) = self.rssi {
            write!(f, " {} dBm", rssi)?;
        }
        Ok(())
    }
}

/// Immediate rejection of a transport request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("characteristic {0} not available")]
    ChannelUnavailable(Channel),

    #[error("{0}")]
    Backend(String),
}

/// Requests the state machine issues to the radio.
pub trait Transport: Send {
    /// Whether the radio is currently powered.
    fn is_enabled(&self) -> bool;

    /// Ask for the radio to be powered on.
    fn request_enable(&mut self) -> Result<(), TransportError>;

    /// Open a connection to the endpoint with the given address.
    fn connect(&mut self, address: &str) -> Result<(), TransportError>;

    /// Start service discovery on the open connection.
    fn discover_services(&mut self) -> Result<(), TransportError>;

    /// Whether discovery found the lock service.
    fn has_service(&self) -> bool;

    /// Whether discovery found the given characteristic.
    fn has_channel(&self, channel: Channel) -> bool;

    /// Enable notifications/indications on a channel.
    fn subscribe(&mut self, channel: Channel) -> Result<(), TransportError>;

    /// Write a value with response.
    fn write(&mut self, channel: Channel, value: &[u8]) -> Result<(), TransportError>;

    /// Drop characteristic references and close the connection.
    fn close(&mut self);

    /// Background task still finishing the last `close`, if the backend
    /// disconnects asynchronously. Awaited before the process exits.
    fn take_close_task(&mut self) -> Option<JoinHandle<()>> {
        None
    }
}
