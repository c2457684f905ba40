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

//! States of the protocol machine and the per-task session context.
//!
//! The machine is either idle or running exactly one task. Each task has its
//! own step enum; both share the link setup steps in [`LinkStep`].

use crate::bluetooth::reassembler::MessageReassembler;
use crate::crypto::{EcdhKeypair, HMAC_LENGTH, NONCE_LENGTH, SECRET_LENGTH};
use crate::error::TaskError;
use crate::events::TaskKind;

/// Link setup, common to both tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStep {
    WaitBtEnabled,
    WaitDeviceSelected,
    WaitConnected,
    WaitServicesDiscovered,
}

impl LinkStep {
    fn failure(self) -> TaskError {
        match self {
            LinkStep::WaitBtEnabled => TaskError::TransportUnavailable,
            LinkStep::WaitDeviceSelected => TaskError::NoEndpointSelected,
            LinkStep::WaitConnected => TaskError::ConnectionFailed,
            LinkStep::WaitServicesDiscovered => TaskError::ServiceDiscoveryFailed,
        }
    }
}

/// Steps of the unlock task after link setup.
///
/// There is no step waiting for the nonce subscription acknowledgment: the
/// lock may indicate the nonce before that acknowledgment arrives, so the
/// nonce itself is taken as proof of a successful subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStep {
    Link(LinkStep),
    WaitNonce,
    WaitHmacPart1Ack,
    WaitHmacPart2Ack,
}

impl UnlockStep {
    /// Error reported when the transport fails or disconnects in this step.
    pub fn failure(self) -> TaskError {
        match self {
            UnlockStep::Link(link) => link.failure(),
            UnlockStep::WaitNonce => TaskError::SubscribeFailed,
            UnlockStep::WaitHmacPart1Ack | UnlockStep::WaitHmacPart2Ack => TaskError::WriteFailed,
        }
    }
}

/// Steps of the key exchange task after link setup.
///
/// Unlike the nonce channel, the cfg-out subscription waits for its explicit
/// acknowledgment before the client key is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeStep {
    Link(LinkStep),
    WaitCfgOutSubscribeAck,
    WaitKeyPart1Ack,
    WaitKeyPart2Ack,
    WaitServerKeyPart1,
    WaitServerKeyPart2,
}

impl KeyExchangeStep {
    /// Error reported when the transport fails or disconnects in this step.
    pub fn failure(self) -> TaskError {
        match self {
            KeyExchangeStep::Link(link) => link.failure(),
            KeyExchangeStep::WaitCfgOutSubscribeAck
            | KeyExchangeStep::WaitServerKeyPart1
            | KeyExchangeStep::WaitServerKeyPart2 => TaskError::SubscribeFailed,
            KeyExchangeStep::WaitKeyPart1Ack | KeyExchangeStep::WaitKeyPart2Ack => {
                TaskError::WriteFailed
            }
        }
    }
}

/// Top-level machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Unlock(UnlockStep),
    KeyExchange(KeyExchangeStep),
}

impl State {
    pub fn is_idle(&self) -> bool {
        matches!(self, State::Idle)
    }

    /// Task currently running, if any.
    pub fn task(&self) -> Option<TaskKind> {
        match self {
            State::Idle => None,
            State::Unlock(_) => Some(TaskKind::Unlock),
            State::KeyExchange(_) => Some(TaskKind::KeyExchange),
        }
    }

    /// State for a link setup step of the given task.
    pub fn link(task: TaskKind, step: LinkStep) -> Self {
        match task {
            TaskKind::Unlock => State::Unlock(UnlockStep::Link(step)),
            TaskKind::KeyExchange => State::KeyExchange(KeyExchangeStep::Link(step)),
        }
    }
}

/// Key in use for unlocking: its slot number on the lock and the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key_number: u8,
    pub secret: [u8; SECRET_LENGTH],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_number", &self.key_number)
            .finish_non_exhaustive()
    }
}

/// Intermediate values of a running key exchange.
#[derive(Debug)]
pub struct KeyExchangeSession {
    pub target_key_number: u8,
    /// Generated once the cfg-out subscription is acknowledged.
    pub client: Option<EcdhKeypair>,
    pub server_key: MessageReassembler,
    pub shared_secret: Option<[u8; SECRET_LENGTH]>,
}

impl KeyExchangeSession {
    pub fn new(target_key_number: u8) -> Self {
        Self {
            target_key_number,
            client: None,
            server_key: MessageReassembler::new(target_key_number),
            shared_secret: None,
        }
    }
}

/// Transient values owned by the running task.
#[derive(Debug, Default)]
pub struct SessionContext {
    pub nonce: Option<[u8; NONCE_LENGTH]>,
    pub hmac: Option<[u8; HMAC_LENGTH]>,
    pub key_exchange: Option<KeyExchangeSession>,
}

impl SessionContext {
    /// Discard everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
