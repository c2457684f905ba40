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

//! Cryptographic primitives used by the lock protocols.
//!
//! Everything here is a pure function except key pair generation, which
//! takes its randomness from the caller.

pub mod ecdh;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha512};
use std::fmt;
use thiserror::Error;

pub use ecdh::{derive_shared_secret, generate_key_pair, EcdhKeypair};

/// Length of the shared secret and of X25519 keys.
pub const SECRET_LENGTH: usize = 32;

/// Length of the truncated HMAC sent to unlock the door.
pub const HMAC_LENGTH: usize = 32;

/// Length of the nonce issued by the lock.
pub const NONCE_LENGTH: usize = 16;

/// Length of the human-verifiable checksum of a shared secret.
pub const CHECKSUM_LENGTH: usize = 8;

/// Errors raised by the crypto primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("HMAC key rejected: {0}")]
    InvalidKey(String),
}

/// HMAC-SHA-512 truncated to its first 32 bytes (HMAC-SHA-512-256).
pub fn hmac_sha512_256(key: &[u8], message: &[u8]) -> Result<[u8; HMAC_LENGTH], CryptoError> {
    let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(message);
    let full = mac.finalize().into_bytes();

    let mut truncated = [0u8; HMAC_LENGTH];
    truncated.copy_from_slice(&full[..HMAC_LENGTH]);
    Ok(truncated)
}

/// Plain SHA-512.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let digest = Sha512::digest(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

/// Short digest of a shared secret, shown to the user so both ends can be
/// compared out-of-band before the key is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum([u8; CHECKSUM_LENGTH]);

impl Checksum {
    /// Checksum of a shared secret: the first 8 bytes of its SHA-512 hash.
    pub fn of_secret(secret: &[u8; SECRET_LENGTH]) -> Self {
        let hash = sha512(secret);
        let mut bytes = [0u8; CHECKSUM_LENGTH];
        bytes.copy_from_slice(&hash[..CHECKSUM_LENGTH]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LENGTH] {
        &self.0
    }
}

impl From<[u8; CHECKSUM_LENGTH]> for Checksum {
    fn from(bytes: [u8; CHECKSUM_LENGTH]) -> Self {
        Self(bytes)
    }
}

/// Renders 16 lowercase hex digits, byte 0 leftmost, high nibble first.
impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
