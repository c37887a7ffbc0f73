//! Per-chunk XChaCha20-Poly1305 encryption/decryption
//!
//! Stored chunk object (binary):
//! ```text
//! [N bytes: ciphertext][16 bytes: Poly1305 tag]
//! AAD = chunk_index (8 bytes, big-endian) || file_id (8 bytes, big-endian)
//! ```
//!
//! The 24-byte random nonce is kept in the chunk's metadata record, not in the
//! object. The AAD binds each chunk to its position and file, so stored
//! objects cannot be reordered or swapped between files.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Tag, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use cvault_core::{CvaultError, CvaultResult};

use crate::keys::FileKey;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Output of [`encrypt_chunk`], tag kept apart from the ciphertext body.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Encrypt a single chunk with a fresh random nonce.
pub fn encrypt_chunk(
    file_key: &FileKey,
    chunk_index: u64,
    file_id: u64,
    plaintext: &[u8],
) -> CvaultResult<SealedChunk> {
    let cipher = XChaCha20Poly1305::new(file_key.as_bytes().into());

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(
            XNonce::from_slice(&nonce),
            &build_aad(chunk_index, file_id),
            &mut ciphertext,
        )
        .map_err(|e| CvaultError::Other(anyhow::anyhow!("chunk encryption failed: {e}")))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);

    Ok(SealedChunk {
        nonce,
        tag: tag_bytes,
        ciphertext,
    })
}

/// Decrypt a stored chunk object (`ciphertext || tag`).
pub fn decrypt_chunk(
    file_key: &FileKey,
    chunk_index: u64,
    file_id: u64,
    nonce: &[u8],
    stored: &[u8],
) -> CvaultResult<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(CvaultError::AuthenticationFailure(format!(
            "chunk nonce must be {NONCE_SIZE} bytes, got {}",
            nonce.len()
        )));
    }
    if stored.len() < TAG_SIZE {
        return Err(CvaultError::AuthenticationFailure(format!(
            "encrypted chunk too short: {} bytes (minimum {TAG_SIZE})",
            stored.len()
        )));
    }

    let (body, tag) = stored.split_at(stored.len() - TAG_SIZE);
    let cipher = XChaCha20Poly1305::new(file_key.as_bytes().into());

    let mut plaintext = body.to_vec();
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            &build_aad(chunk_index, file_id),
            &mut plaintext,
            Tag::from_slice(tag),
        )
        .map_err(|_| {
            CvaultError::AuthenticationFailure(
                "chunk decryption failed: invalid key, corrupted data, or wrong chunk_index/file_id"
                    .into(),
            )
        })?;

    Ok(plaintext)
}

/// Build AAD: chunk_index (8 bytes BE) || file_id (8 bytes BE)
fn build_aad(chunk_index: u64, file_id: u64) -> [u8; 16] {
    let mut aad = [0u8; 16];
    aad[..8].copy_from_slice(&chunk_index.to_be_bytes());
    aad[8..].copy_from_slice(&file_id.to_be_bytes());
    aad
}
