//! cvault-chunks: deterministic fixed-size chunking and BLAKE3 digests
//!
//! # Overview
//! - `fixed`: split a buffer into index-ordered, fixed-size spans
//! - `blake3`: content digests over stored (encrypted) chunk bytes

pub mod blake3;
pub mod fixed;

pub use blake3::{digest_hex, hash_bytes, hash_from_hex, hash_to_hex, verify_digest, Hash};
pub use fixed::{chunk_count, split, ChunkSpan};
