//! Checksum and key-hash utilities for SegVault
//!
//! All on-storage integrity checks (certificates, frame trailers, the
//! superblock) use CRC32C. Key hashing for partition lookup uses xxHash64
//! seeded with the table id.

use crate::types::KeyHash;

/// Quick CRC32C computation.
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification.
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Streaming CRC32C calculator.
#[derive(Clone, Copy, Debug, Default)]
pub struct Crc32c {
    state: u32,
}

impl Crc32c {
    /// Create a new calculator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the calculator with more data.
    pub fn update(&mut self, data: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, data);
    }

    /// Return the checksum of everything fed so far.
    #[must_use]
    pub fn finish(self) -> u32 {
        self.state
    }

    /// Reset the calculator for reuse.
    pub fn reset(&mut self) {
        self.state = 0;
    }
}

/// Hash an object key into the 64-bit key-hash space.
///
/// The table id seeds the hash so equal keys in different tables land on
/// independent hashes.
#[inline]
#[must_use]
pub fn key_hash(table_id: u64, key: &[u8]) -> KeyHash {
    xxhash_rust::xxh64::xxh64(key, table_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_matches_streaming() {
        let data = b"segment replica bytes";

        let expected = compute_crc32c(data);

        let mut calc = Crc32c::new();
        calc.update(&data[..7]);
        calc.update(&data[7..]);
        assert_eq!(calc.finish(), expected);
    }

    #[test]
    fn test_verify_crc32c() {
        let data = b"hello, backup";
        let crc = compute_crc32c(data);
        assert!(verify_crc32c(data, crc));
        assert!(!verify_crc32c(b"hello, backuq", crc));
    }

    #[test]
    fn test_empty_crc_is_zero() {
        // An empty certified prefix verifies against a zeroed certificate.
        assert_eq!(compute_crc32c(&[]), 0);
    }

    #[test]
    fn test_key_hash_seeded_by_table() {
        assert_eq!(key_hash(1, b"k"), key_hash(1, b"k"));
        assert_ne!(key_hash(1, b"k"), key_hash(2, b"k"));
        assert_ne!(key_hash(1, b"k"), key_hash(1, b"l"));
    }
}
