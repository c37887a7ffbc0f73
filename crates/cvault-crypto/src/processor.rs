//! Chunk processor: transform, then AEAD, then digest the stored bytes
//!
//! Pure with respect to storage. The same code runs in the worker daemon and
//! in the in-process fallback path.

use std::path::PathBuf;

use cvault_chunks::{digest_hex, verify_digest};
use cvault_core::types::TransformKind;
use cvault_core::{CvaultError, CvaultResult};

use crate::chunk::{decrypt_chunk, encrypt_chunk};
use crate::keys::FileKey;
use crate::transform::TransformStage;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Algorithm version recorded on every chunk this processor produces.
pub const CHUNK_ALGO_VERSION: &str = "xchacha20poly1305-v1";

/// Where a chunk belongs. Bound into the AEAD as associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkContext {
    pub file_id: u64,
    pub index: u32,
}

/// Everything needed to persist and later verify one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub index: u32,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub ciphertext: Vec<u8>,
    /// BLAKE3 hex of `ciphertext || tag`
    pub digest: String,
    /// Stored byte count (`ciphertext.len() + TAG_SIZE`)
    pub size: u64,
    pub transform: TransformKind,
}

impl ChunkResult {
    /// The bytes written to the object store.
    pub fn sealed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ciphertext.len() + TAG_SIZE);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Internal consistency: size matches and the digest covers the sealed bytes.
    pub fn verify(&self) -> bool {
        self.size == (self.ciphertext.len() + TAG_SIZE) as u64
            && verify_digest(&self.sealed_bytes(), &self.digest)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChunkProcessor {
    transforms: TransformStage,
}

impl ChunkProcessor {
    pub fn new(accelerator_device: impl Into<PathBuf>) -> Self {
        Self {
            transforms: TransformStage::new(accelerator_device.into()),
        }
    }

    pub fn transforms(&self) -> &TransformStage {
        &self.transforms
    }

    /// Transform and encrypt one chunk under `file_key` with a fresh nonce.
    pub fn process(
        &self,
        file_key: &FileKey,
        ctx: ChunkContext,
        plaintext: &[u8],
        transform: TransformKind,
    ) -> CvaultResult<ChunkResult> {
        let mut staged = plaintext.to_vec();
        self.transforms
            .get(transform)
            .forward(file_key, &mut staged)?;

        let sealed = encrypt_chunk(file_key, ctx.index as u64, ctx.file_id, &staged)?;

        let mut result = ChunkResult {
            index: ctx.index,
            nonce: sealed.nonce,
            tag: sealed.tag,
            size: (sealed.ciphertext.len() + TAG_SIZE) as u64,
            ciphertext: sealed.ciphertext,
            digest: String::new(),
            transform,
        };
        result.digest = digest_hex(&result.sealed_bytes());

        tracing::trace!(
            file_id = ctx.file_id,
            index = ctx.index,
            size = result.size,
            ?transform,
            "chunk processed"
        );
        Ok(result)
    }

    /// Verify, decrypt and untransform a stored chunk object.
    pub fn open(
        &self,
        file_key: &FileKey,
        ctx: ChunkContext,
        nonce: &[u8],
        stored: &[u8],
        expected_digest: &str,
        transform: TransformKind,
    ) -> CvaultResult<Vec<u8>> {
        if !verify_digest(stored, expected_digest) {
            return Err(CvaultError::AuthenticationFailure(format!(
                "chunk {} of file {} does not match its recorded digest",
                ctx.index, ctx.file_id
            )));
        }

        let mut plaintext = decrypt_chunk(file_key, ctx.index as u64, ctx.file_id, nonce, stored)?;
        self.transforms
            .get(transform)
            .inverse(file_key, &mut plaintext)?;
        Ok(plaintext)
    }
}
