//! cvault-crypto: key vault, key hierarchy and per-chunk encryption
//!
//! Two AEAD domains:
//! ```text
//! Wrapping (AES-256-GCM, nonce(12) || tag(16) || ct)
//!   ├── vault key table      sealed under HKDF(root, "cvault-keytable")
//!   ├── user master keys     sealed under the user's named vault key
//!   └── per-file keys        sealed under HKDF(root, "cvault-file-wrap")
//! Chunks (XChaCha20-Poly1305, nonce=random_192bit, AAD=chunk_idx||file_id)
//!   └── transform(plaintext) encrypted under the file key, tag stored after ct
//! ```

pub mod aead;
pub mod chunk;
pub mod hierarchy;
pub mod keys;
pub mod processor;
pub mod transform;
pub mod vault;

pub use chunk::{decrypt_chunk, encrypt_chunk, SealedChunk};
pub use hierarchy::{FileKeyDomain, KeyHierarchy};
pub use keys::{generate_file_key, generate_master_key, FileKey, MasterKey, RootSecret};
pub use processor::{ChunkContext, ChunkProcessor, ChunkResult, CHUNK_ALGO_VERSION};
pub use transform::{Transform, TransformStage};
pub use vault::KeyVault;

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const GCM_NONCE_SIZE: usize = 12;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a GCM / Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
