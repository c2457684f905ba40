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

//! User-visible task errors.
//!
//! Each variant names the step that failed. The display text is the message
//! shown to the user.

use thiserror::Error;

/// Why a task was rejected or aborted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("No key defined. Run a key exchange first.")]
    NoKeyConfigured,

    #[error("Another task is already in progress.")]
    TaskAlreadyInProgress,

    #[error("Bluetooth is not available.")]
    TransportUnavailable,

    #[error("No lock selected.")]
    NoEndpointSelected,

    #[error("Could not connect to the lock.")]
    ConnectionFailed,

    #[error("Service discovery failed.")]
    ServiceDiscoveryFailed,

    #[error("The device does not offer the lock service.")]
    RequiredServiceMissing,

    #[error("The lock service is missing a required characteristic.")]
    RequiredCharacteristicMissing,

    #[error("Could not subscribe to lock notifications.")]
    SubscribeFailed,

    #[error("Could not send data to the lock.")]
    WriteFailed,

    #[error("The lock sent a malformed message.")]
    MalformedNotification,

    #[error("The lock sent an unexpected key number or key part.")]
    ProtocolViolation,

    #[error("No exchanged key to confirm.")]
    NoSharedSecretToConfirm,

    #[error("Cryptographic computation failed.")]
    ComputationFailed,
}
