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

//! GATT identifiers and value limits of the lock service.
//!
//! All UUIDs share the base `0a9dXXXX-5ff4-4c58-8a53-627de7cf1faf`, with the
//! 16-bit id of the service or characteristic in place of `XXXX`.

use uuid::Uuid;

/// Base UUID with a zeroed 16-bit id field.
pub const BASE_UUID: u128 = 0x0a9d0000_5ff4_4c58_8a53_627de7cf1faf;

pub const SERVICE_ID: u16 = 0x0001;
pub const NONCE_ID: u16 = 0x0002;
pub const UNLOCK_ID: u16 = 0x0003;
pub const CFG_IN_ID: u16 = 0x0004;
pub const CFG_OUT_ID: u16 = 0x0005;

/// Lock service.
pub const SERVICE_UUID: Uuid = uuid_from_id(SERVICE_ID);
/// Nonce characteristic (indicate). Lock → client.
pub const NONCE_UUID: Uuid = uuid_from_id(NONCE_ID);
/// Unlock characteristic (write). Client → lock.
pub const UNLOCK_UUID: Uuid = uuid_from_id(UNLOCK_ID);
/// Key exchange input characteristic (write). Client → lock.
pub const CFG_IN_UUID: Uuid = uuid_from_id(CFG_IN_ID);
/// Key exchange output characteristic (indicate). Lock → client.
pub const CFG_OUT_UUID: Uuid = uuid_from_id(CFG_OUT_ID);

/// Number of key slots on the lock.
pub const KEY_COUNT: u8 = 4;

/// Default duration of an endpoint scan in seconds.
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 15;

/// Substitute a 16-bit id into the base UUID.
pub const fn uuid_from_id(id: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((id as u128) << 96))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_uuid() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "0a9d0001-5ff4-4c58-8a53-627de7cf1faf"
        );
    }

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(NONCE_UUID.to_string(), "0a9d0002-5ff4-4c58-8a53-627de7cf1faf");
        assert_eq!(UNLOCK_UUID.to_string(), "0a9d0003-5ff4-4c58-8a53-627de7cf1faf");
        assert_eq!(CFG_IN_UUID.to_string(), "0a9d0004-5ff4-4c58-8a53-627de7cf1faf");
        assert_eq!(CFG_OUT_UUID.to_string(), "0a9d0005-5ff4-4c58-8a53-627de7cf1faf");
    }
}
