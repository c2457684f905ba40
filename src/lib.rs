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

//! Latchkey: client for a Bluetooth LE door lock.
//!
//! Unlocks the door with a nonce/HMAC challenge and provisions new keys with
//! an X25519 key exchange confirmed by the user.

pub mod bluetooth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod protocol;
pub mod storage;
pub mod ui;
