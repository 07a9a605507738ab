//! Rolling-XOR obfuscation for on-disk coin-store bytes.
//!
//! Stores XOR their records with a fixed 8-byte key so raw database files do
//! not contain recognizable script or value patterns. Obfuscation is not
//! encryption; the key lives next to the data. Applying the same key twice
//! restores the original bytes.

use serde::{Deserialize, Serialize};

/// Key width in bytes.
pub const KEY_SIZE: usize = 8;

/// A rolling-XOR obfuscator with a 64-bit key.
///
/// `apply` XORs byte `i` of the buffer with key byte
/// `(key_offset + i) % KEY_SIZE`, so a record can be processed in arbitrary
/// chunks as long as each chunk passes its absolute offset.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Obfuscation {
    key: [u8; KEY_SIZE],
}

impl Obfuscation {
    pub fn new(key: u64) -> Self {
        Self { key: key.to_le_bytes() }
    }

    pub fn from_key_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    pub fn key(&self) -> u64 {
        u64::from_le_bytes(self.key)
    }

    /// An all-zero key disables obfuscation entirely.
    pub fn is_enabled(&self) -> bool {
        self.key != [0u8; KEY_SIZE]
    }

    /// XOR the buffer in place, continuing the key stream at `key_offset`.
    pub fn apply(&self, buf: &mut [u8], key_offset: usize) {
        if !self.is_enabled() {
            return;
        }
        // Rotating the key by the offset makes every 8-byte chunk use the
        // same pattern, so the whole buffer runs through one aligned loop.
        let rotation = ((key_offset % KEY_SIZE) * 8) as u32;
        let rotated = u64::from_le_bytes(self.key).rotate_right(rotation);
        let pattern = rotated.to_le_bytes();

        let mut chunks = buf.chunks_exact_mut(KEY_SIZE);
        for chunk in chunks.by_ref() {
            for (byte, key_byte) in chunk.iter_mut().zip(pattern) {
                *byte ^= key_byte;
            }
        }
        for (byte, key_byte) in chunks.into_remainder().iter_mut().zip(pattern) {
            *byte ^= key_byte;
        }
    }
}
