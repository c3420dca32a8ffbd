//! 256-bit BLAKE3 digests backing feature fingerprints.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte BLAKE3 digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Digest size in bytes
    pub const LEN: usize = 32;

    /// Digest of a single buffer
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Finish an incremental hasher
    #[must_use]
    pub fn finish(hasher: &blake3::Hasher) -> Self {
        Self(*hasher.finalize().as_bytes())
    }

    /// Wrap raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Leading `n` bytes in hex; log fields use 8
    #[must_use]
    pub fn short_hex(&self, n: usize) -> String {
        hex::encode(&self.0[..n.min(Self::LEN)])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(Hash::of(b"mesh"), Hash::of(b"mesh"));
        assert_ne!(Hash::of(b"mesh"), Hash::of(b"mash"));
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tes");
        hasher.update(b"sera");
        assert_eq!(Hash::finish(&hasher), Hash::of(b"tessera"));
    }

    #[test]
    fn test_hex_forms() {
        let hash = Hash::from_bytes([0xab; 32]);
        assert_eq!(hash.short_hex(4), "abababab");
        assert_eq!(hash.short_hex(64).len(), 64);
        assert_eq!(hash.to_string().len(), 64);
    }
}
