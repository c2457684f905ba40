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

//! Curve25519 Diffie-Hellman key agreement.

use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use super::SECRET_LENGTH;

/// An X25519 key pair held for the duration of one key exchange.
pub struct EcdhKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EcdhKeypair {
    /// Generate a fresh key pair from the supplied random source.
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from raw private key bytes.
    pub fn from_private_bytes(bytes: [u8; SECRET_LENGTH]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; SECRET_LENGTH] {
        self.public.to_bytes()
    }

    pub fn private_bytes(&self) -> [u8; SECRET_LENGTH] {
        self.secret.to_bytes()
    }

    /// Diffie-Hellman with the peer's public key.
    pub fn shared_secret(&self, peer_public: &[u8; SECRET_LENGTH]) -> [u8; SECRET_LENGTH] {
        let peer = PublicKey::from(*peer_public);
        self.secret.diffie_hellman(&peer).to_bytes()
    }
}

impl std::fmt::Debug for EcdhKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhKeypair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Generate a key pair, returned as `(private, public)` byte arrays.
pub fn generate_key_pair<R: RngCore + CryptoRng + ?Sized>(
    rng: &mut R,
) -> ([u8; SECRET_LENGTH], [u8; SECRET_LENGTH]) {
    let keypair = EcdhKeypair::generate(rng);
    (keypair.private_bytes(), keypair.public_bytes())
}

/// Derive the shared secret from our private key and the peer's public key.
pub fn derive_shared_secret(
    private_key: &[u8; SECRET_LENGTH],
    peer_public_key: &[u8; SECRET_LENGTH],
) -> [u8; SECRET_LENGTH] {
    EcdhKeypair::from_private_bytes(*private_key).shared_secret(peer_public_key)
}
