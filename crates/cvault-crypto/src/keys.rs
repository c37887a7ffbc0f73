//! Key material types and root-secret key derivation
//!
//! ```text
//! RootSecret (32 bytes, from config, never persisted)
//!   ├── HKDF("cvault-keytable")  → key-table key   (encrypts the vault's key table)
//!   └── HKDF("cvault-file-wrap") → file-wrap key   (wraps per-file keys)
//! NamedKey (vault, one per user) → wraps the user's MasterKey
//! FileKey (random per file)      → encrypts every chunk of that file
//! ```

use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use cvault_core::{CvaultError, CvaultResult};

use crate::KEY_SIZE;

const TABLE_KEY_INFO: &[u8] = b"cvault-keytable";
const FILE_WRAP_INFO: &[u8] = b"cvault-file-wrap";

/// A per-file 256-bit encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A user's 256-bit master key. Only ever stored wrapped under the user's vault key.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The process-wide root secret. Loaded once at startup, never mutated.
pub struct RootSecret {
    bytes: [u8; KEY_SIZE],
}

impl RootSecret {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Decode a base64-encoded 32-byte secret.
    pub fn from_base64(encoded: &SecretString) -> CvaultResult<Self> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.expose_secret().trim().as_bytes())
                .map_err(|e| CvaultError::Config(format!("root secret is not base64: {e}")))?,
        );
        if decoded.len() != KEY_SIZE {
            return Err(CvaultError::Config(format!(
                "root secret must be {KEY_SIZE} bytes, got {}",
                decoded.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }

    /// Root secret from `[keys] root_secret` / `CVAULT_ROOT_SECRET`.
    pub fn from_config(keys: &cvault_core::config::KeysConfig) -> CvaultResult<Self> {
        let encoded = keys.root_secret.as_ref().ok_or_else(|| {
            CvaultError::Config("no root secret configured: export CVAULT_ROOT_SECRET".into())
        })?;
        Self::from_base64(encoded)
    }

    /// Key that encrypts the vault's persisted key table.
    pub fn table_key(&self) -> CvaultResult<Zeroizing<[u8; KEY_SIZE]>> {
        hkdf_derive(&self.bytes, TABLE_KEY_INFO)
    }

    /// Key that wraps per-file keys.
    pub fn file_wrap_key(&self) -> CvaultResult<Zeroizing<[u8; KEY_SIZE]>> {
        hkdf_derive(&self.bytes, FILE_WRAP_INFO)
    }
}

impl Drop for RootSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit file encryption key.
pub fn generate_file_key() -> FileKey {
    FileKey::from_bytes(random_key())
}

/// Generate a random 256-bit user master key.
pub fn generate_master_key() -> MasterKey {
    MasterKey::from_bytes(random_key())
}

pub(crate) fn random_key() -> [u8; KEY_SIZE] {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive(
    ikm: &[u8; KEY_SIZE],
    info: &[u8],
) -> CvaultResult<Zeroizing<[u8; KEY_SIZE]>> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(info, &mut okm[..])
        .map_err(|e| CvaultError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
