use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use serde::{Deserialize, Serialize};
use std::fmt;

type KeyedBlake2b256 = Blake2bMac<U32>;

/// A 32-byte object identifier computed as keyed BLAKE2b-256 of the
/// plaintext, XORed with the repository's chunk seed.
///
/// The seed separates identically keyed repositories: the same plaintext
/// under the same id key but a different seed yields a different id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub [u8; 32]);

/// The manifest lives at the all-zero id.
pub const MANIFEST_ID: ChunkId = ChunkId([0u8; 32]);

impl ChunkId {
    /// Compute an id using keyed BLAKE2b-256 (BLAKE2b-MAC with 32-byte
    /// output) and the repository chunk seed.
    pub fn compute(key: &[u8; 32], seed: &[u8; 32], data: &[u8]) -> Self {
        let mut hasher =
            KeyedBlake2b256::new_from_slice(key).expect("valid 32-byte key for BLAKE2b");
        Mac::update(&mut hasher, data);
        let digest = hasher.finalize().into_bytes();
        let mut out = [0u8; 32];
        for (i, b) in digest.iter().enumerate() {
            out[i] = b ^ seed[i];
        }
        ChunkId(out)
    }

    /// Hex-encode the full id.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(ChunkId(arr))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [0xAA; 32]
    }

    fn zero_seed() -> [u8; 32] {
        [0u8; 32]
    }

    #[test]
    fn compute_deterministic() {
        let id1 = ChunkId::compute(&test_key(), &zero_seed(), b"hello world");
        let id2 = ChunkId::compute(&test_key(), &zero_seed(), b"hello world");
        assert_eq!(id1, id2);
    }

    #[test]
    fn compute_different_data_different_id() {
        let id1 = ChunkId::compute(&test_key(), &zero_seed(), b"hello");
        let id2 = ChunkId::compute(&test_key(), &zero_seed(), b"world");
        assert_ne!(id1, id2);
    }

    #[test]
    fn compute_different_key_different_id() {
        let id1 = ChunkId::compute(&[0xAA; 32], &zero_seed(), b"same data");
        let id2 = ChunkId::compute(&[0xBB; 32], &zero_seed(), b"same data");
        assert_ne!(id1, id2);
    }

    #[test]
    fn seed_separates_repositories() {
        let id1 = ChunkId::compute(&test_key(), &[0u8; 32], b"same data");
        let id2 = ChunkId::compute(&test_key(), &[0x5C; 32], b"same data");
        assert_ne!(id1, id2);
    }

    #[test]
    fn seed_xor_is_invertible() {
        // XOR with the seed twice recovers the raw keyed hash.
        let seed = [0x5C; 32];
        let with_seed = ChunkId::compute(&test_key(), &seed, b"data");
        let without = ChunkId::compute(&test_key(), &[0u8; 32], b"data");
        let mut recovered = [0u8; 32];
        for i in 0..32 {
            recovered[i] = with_seed.0[i] ^ seed[i];
        }
        assert_eq!(recovered, without.0);
    }

    #[test]
    fn hex_roundtrip() {
        let id = ChunkId::compute(&test_key(), &zero_seed(), b"test");
        assert_eq!(id.to_hex().len(), 64);
        assert_eq!(ChunkId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(ChunkId::from_hex("zz"), None);
    }

    #[test]
    fn serde_roundtrip() {
        let id = ChunkId::compute(&test_key(), &zero_seed(), b"roundtrip");
        let serialized = rmp_serde::to_vec(&id).unwrap();
        let deserialized: ChunkId = rmp_serde::from_slice(&serialized).unwrap();
        assert_eq!(id, deserialized);
    }
}
