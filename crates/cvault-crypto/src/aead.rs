//! AES-256-GCM sealing for small secrets (key wrapping, the vault key table)
//!
//! Sealed format (binary):
//! ```text
//! [12 bytes: random nonce][16 bytes: GCM tag][N bytes: ciphertext]
//! ```
//!
//! Opening fails closed: truncated input or a tag mismatch returns
//! `AuthenticationFailure` and no plaintext.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::RngCore;
use zeroize::Zeroizing;

use cvault_core::{CvaultError, CvaultResult};

use crate::{GCM_NONCE_SIZE, KEY_SIZE, TAG_SIZE};

/// Encrypt `plaintext` under `key` with a fresh nonce.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> CvaultResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; GCM_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let mut out = Vec::with_capacity(GCM_NONCE_SIZE + TAG_SIZE + plaintext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&[0u8; TAG_SIZE]);
    out.extend_from_slice(plaintext);

    let tag = cipher
        .encrypt_in_place_detached(
            Nonce::from_slice(&nonce_bytes),
            aad,
            &mut out[GCM_NONCE_SIZE + TAG_SIZE..],
        )
        .map_err(|e| CvaultError::Other(anyhow::anyhow!("AES-GCM seal failed: {e}")))?;
    out[GCM_NONCE_SIZE..GCM_NONCE_SIZE + TAG_SIZE].copy_from_slice(&tag);

    Ok(out)
}

/// Decrypt and verify the output of [`seal`].
pub fn open(key: &[u8; KEY_SIZE], sealed: &[u8], aad: &[u8]) -> CvaultResult<Zeroizing<Vec<u8>>> {
    if sealed.len() < GCM_NONCE_SIZE + TAG_SIZE {
        return Err(CvaultError::AuthenticationFailure(format!(
            "sealed value too short: {} bytes (minimum {})",
            sealed.len(),
            GCM_NONCE_SIZE + TAG_SIZE
        )));
    }

    let (nonce_bytes, rest) = sealed.split_at(GCM_NONCE_SIZE);
    let (tag_bytes, ciphertext) = rest.split_at(TAG_SIZE);

    let cipher = Aes256Gcm::new(key.into());
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce_bytes),
            aad,
            buffer.as_mut_slice(),
            Tag::from_slice(tag_bytes),
        )
        .map_err(|_| {
            CvaultError::AuthenticationFailure("wrong key or corrupted data".into())
        })?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; KEY_SIZE] = [0x11; KEY_SIZE];

    #[test]
    fn test_seal_open_roundtrip() {
        let sealed = seal(&KEY, b"master key bytes", b"").unwrap();
        assert_eq!(sealed.len(), GCM_NONCE_SIZE + TAG_SIZE + 16);
        let opened = open(&KEY, &sealed, b"").unwrap();
        assert_eq!(opened.as_slice(), b"master key bytes");
    }

    #[test]
    fn test_nonce_is_fresh() {
        let a = seal(&KEY, b"same", b"").unwrap();
        let b = seal(&KEY, b"same", b"").unwrap();
        assert_ne!(a[..GCM_NONCE_SIZE], b[..GCM_NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_wrong_key() {
        let sealed = seal(&KEY, b"secret", b"").unwrap();
        let err = open(&[0x22; KEY_SIZE], &sealed, b"").unwrap_err();
        assert!(matches!(err, CvaultError::AuthenticationFailure(_)));
    }

    #[test]
    fn test_open_wrong_aad() {
        let sealed = seal(&KEY, b"secret", b"user-1").unwrap();
        let err = open(&KEY, &sealed, b"user-2").unwrap_err();
        assert!(matches!(err, CvaultError::AuthenticationFailure(_)));
    }

    #[test]
    fn test_every_tampered_byte_fails() {
        let sealed = seal(&KEY, b"tamper me", b"").unwrap();
        for i in 0..sealed.len() {
            let mut bad = sealed.clone();
            bad[i] ^= 0x80;
            assert!(
                matches!(open(&KEY, &bad, b""), Err(CvaultError::AuthenticationFailure(_))),
                "flip at byte {i} must fail"
            );
        }
    }

    #[test]
    fn test_truncated_input() {
        let sealed = seal(&KEY, b"x", b"").unwrap();
        let err = open(&KEY, &sealed[..GCM_NONCE_SIZE + 4], b"").unwrap_err();
        assert!(matches!(err, CvaultError::AuthenticationFailure(_)));
    }

    proptest! {
        #[test]
        fn prop_roundtrip_and_key_separation(
            key in prop::array::uniform32(any::<u8>()),
            other in prop::array::uniform32(any::<u8>()),
            secret in prop::collection::vec(any::<u8>(), 0..=256),
        ) {
            let sealed = seal(&key, &secret, b"").unwrap();
            let opened = open(&key, &sealed, b"").unwrap();
            prop_assert_eq!(opened.as_slice(), secret.as_slice());
            if key != other {
                prop_assert!(matches!(
                    open(&other, &sealed, b""),
                    Err(CvaultError::AuthenticationFailure(_))
                ));
            }
        }
    }
}
