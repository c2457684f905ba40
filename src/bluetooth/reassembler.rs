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

//! Chunking and reassembly of 32-byte values over 18-byte characteristics.
//!
//! Public keys and HMACs do not fit into a single characteristic value, so
//! they travel as two chunks:
//!
//! ```text
//! [key number][part][16 bytes of payload]
//! ```
//!
//! Part 0 carries payload bytes `[0..16)`, part 1 carries `[16..32)`. The
//! position of a half is fixed by its part index, never by arrival order, and
//! part 1 is only accepted after part 0.

use thiserror::Error;
use tracing::debug;

/// Size of one chunk on the wire.
pub const CHUNK_LENGTH: usize = 18;

/// Payload bytes carried by one chunk.
pub const PART_LENGTH: usize = 16;

/// Size of a reassembled value.
pub const VALUE_LENGTH: usize = 2 * PART_LENGTH;

/// One wire chunk.
pub type Chunk = [u8; CHUNK_LENGTH];

/// Reasons a received chunk is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error("chunk is {0} bytes long, expected 18")]
    InvalidLength(usize),

    #[error("chunk for key {received}, expected key {expected}")]
    KeyMismatch { expected: u8, received: u8 },

    #[error("chunk carries part {received}, expected part {expected}")]
    PartMismatch { expected: u8, received: u8 },

    #[error("value already complete, unexpected part {0}")]
    AlreadyComplete(u8),
}

/// Build the chunk carrying `part` (0 or 1) of `value`.
pub fn chunk_part(value: &[u8; VALUE_LENGTH], key_id: u8, part: u8) -> Chunk {
    debug_assert!(part < 2, "a value has exactly two parts");
    let offset = usize::from(part) * PART_LENGTH;

    let mut chunk = [0u8; CHUNK_LENGTH];
    chunk[0] = key_id;
    chunk[1] = part;
    chunk[2..].copy_from_slice(&value[offset..offset + PART_LENGTH]);
    chunk
}

/// Split a 32-byte value into its two tagged chunks, part 0 first.
pub fn split_value(value: &[u8; VALUE_LENGTH], key_id: u8) -> [Chunk; 2] {
    [chunk_part(value, key_id, 0), chunk_part(value, key_id, 1)]
}

/// Sequential reassembler for one 32-byte value tagged with a key number.
#[derive(Debug, Clone)]
pub struct MessageReassembler {
    key_id: u8,
    next_part: u8,
    buffer: [u8; VALUE_LENGTH],
}

impl MessageReassembler {
    /// Create a reassembler expecting part 0 for `key_id`.
    pub fn new(key_id: u8) -> Self {
        Self {
            key_id,
            next_part: 0,
            buffer: [0u8; VALUE_LENGTH],
        }
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    /// Part index the next chunk must carry.
    pub fn next_part(&self) -> u8 {
        self.next_part
    }

    pub fn is_complete(&self) -> bool {
        self.next_part >= 2
    }

    /// Feed one received chunk.
    ///
    /// Returns the complete value once both parts have arrived, `None` after
    /// part 0. Any mismatch leaves the reassembler unchanged.
    pub fn process_chunk(
        &mut self,
        data: &[u8],
    ) -> Result<Option<[u8; VALUE_LENGTH]>, ReassemblyError> {
        if data.len() != CHUNK_LENGTH {
            return Err(ReassemblyError::InvalidLength(data.len()));
        }

        let (key_id, part) = (data[0], data[1]);
        if key_id != self.key_id {
            return Err(ReassemblyError::KeyMismatch {
                expected: self.key_id,
                received: key_id,
            });
        }
        if self.is_complete() {
            return Err(ReassemblyError::AlreadyComplete(part));
        }
        if part != self.next_part {
            return Err(ReassemblyError::PartMismatch {
                expected: self.next_part,
                received: part,
            });
        }

        let offset = usize::from(part) * PART_LENGTH;
        self.buffer[offset..offset + PART_LENGTH].copy_from_slice(&data[2..]);
        self.next_part += 1;
        debug!("Chunk {} of key {} accepted", part, key_id);

        if self.is_complete() {
            Ok(Some(self.buffer))
        } else {
            Ok(None)
        }
    }
}

/// Stateless form of [`MessageReassembler::process_chunk`].
///
/// Validates `chunk` against the expected key and part, writes its payload into
/// `buffer`, and reports whether the value is now complete.
pub fn reassemble(
    buffer: &mut [u8; VALUE_LENGTH],
    expected_key_id: u8,
    expected_part: u8,
    chunk: &[u8],
) -> Result<bool, ReassemblyError> {
    let mut reassembler = MessageReassembler {
        key_id: expected_key_id,
        next_part: expected_part,
        buffer: *buffer,
    };
    let complete = reassembler.process_chunk(chunk)?.is_some();
    *buffer = reassembler.buffer;
    Ok(complete)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_value() -> [u8; VALUE_LENGTH] {
        let mut value = [0u8; VALUE_LENGTH];
        for (i, b) in value.iter_mut().enumerate() {
            *b = i as u8;
        }
        value
    }

    #[test]
    fn test_split_layout() {
        let value = sample_value();
        let [first, second] = split_value(&value, 3);

        assert_eq!(first[0], 3);
        assert_eq!(first[1], 0);
        assert_eq!(&first[2..], &value[..16]);
        assert_eq!(second[0], 3);
        assert_eq!(second[1], 1);
        assert_eq!(&second[2..], &value[16..]);
    }

    #[test]
    fn test_reassemble_in_order() {
        let value = sample_value();
        let [first, second] = split_value(&value, 2);
        let mut reassembler = MessageReassembler::new(2);

        assert_eq!(reassembler.process_chunk(&first), Ok(None));
        assert_eq!(reassembler.next_part(), 1);
        assert_eq!(reassembler.process_chunk(&second), Ok(Some(value)));
        assert!(reassembler.is_complete());
    }

    #[test]
    fn test_part_one_before_part_zero_is_violation() {
        let value = sample_value();
        let [_, second] = split_value(&value, 1);
        let mut reassembler = MessageReassembler::new(1);

        assert_eq!(
            reassembler.process_chunk(&second),
            Err(ReassemblyError::PartMismatch {
                expected: 0,
                received: 1
            })
        );
        assert_eq!(reassembler.next_part(), 0);
    }

    #[test]
    fn test_wrong_key_is_violation() {
        let [first, _] = split_value(&sample_value(), 0);
        let mut reassembler = MessageReassembler::new(1);

        assert_eq!(
            reassembler.process_chunk(&first),
            Err(ReassemblyError::KeyMismatch {
                expected: 1,
                received: 0
            })
        );
    }

    #[test]
    fn test_duplicate_part_zero_is_violation() {
        let [first, _] = split_value(&sample_value(), 0);
        let mut reassembler = MessageReassembler::new(0);

        reassembler.process_chunk(&first).unwrap();
        assert!(matches!(
            reassembler.process_chunk(&first),
            Err(ReassemblyError::PartMismatch { expected: 1, received: 0 })
        ));
    }

    #[test]
    fn test_short_chunk_rejected() {
        let mut reassembler = MessageReassembler::new(0);
        assert_eq!(
            reassembler.process_chunk(&[0, 0, 1, 2]),
            Err(ReassemblyError::InvalidLength(4))
        );
    }

    #[test]
    fn test_chunk_after_completion_rejected() {
        let [first, second] = split_value(&sample_value(), 0);
        let mut reassembler = MessageReassembler::new(0);
        reassembler.process_chunk(&first).unwrap();
        reassembler.process_chunk(&second).unwrap();

        assert_eq!(
            reassembler.process_chunk(&second),
            Err(ReassemblyError::AlreadyComplete(1))
        );
    }

    #[test]
    fn test_stateless_reassemble() {
        let value = sample_value();
        let [first, second] = split_value(&value, 0);
        let mut buffer = [0u8; VALUE_LENGTH];

        assert_eq!(reassemble(&mut buffer, 0, 0, &first), Ok(false));
        assert_eq!(reassemble(&mut buffer, 0, 1, &second), Ok(true));
        assert_eq!(buffer, value);

        let mut untouched = [0u8; VALUE_LENGTH];
        assert!(reassemble(&mut untouched, 0, 0, &second).is_err());
        assert_eq!(untouched, [0u8; VALUE_LENGTH]);
    }
}
