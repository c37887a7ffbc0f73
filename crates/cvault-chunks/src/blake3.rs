//! BLAKE3 digests for stored chunk objects
//!
//! The digest is taken over the bytes that land in the object store
//! (ciphertext + tag), so a read can verify the stored object before any
//! decryption is attempted.

use anyhow::Result;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> Result<Hash> {
    blake3::Hash::from_hex(hex)
        .map_err(|e| anyhow::anyhow!("invalid BLAKE3 hex '{}': {}", hex, e))
}

/// Hex digest of `data`.
pub fn digest_hex(data: &[u8]) -> String {
    hash_to_hex(&hash_bytes(data))
}

/// Constant-time check of `data` against a hex digest. Malformed hex never verifies.
pub fn verify_digest(data: &[u8], expected_hex: &str) -> bool {
    match hash_from_hex(expected_hex) {
        // blake3::Hash equality is constant-time
        Ok(expected) => hash_bytes(data) == expected,
        Err(_) => false,
    }
}
