//! Key hierarchy: per-user master keys and per-file content keys
//!
//! Master keys are wrapped under the user's named vault key. File keys are
//! wrapped under a root-derived key instead, so workers holding only the root
//! secret can unwrap them without loading the vault.

use std::sync::Arc;

use zeroize::Zeroizing;

use cvault_core::types::WrappedSecret;
use cvault_core::{CvaultError, CvaultResult};

use crate::keys::{generate_file_key, generate_master_key, FileKey, MasterKey, RootSecret};
use crate::vault::KeyVault;
use crate::{aead, KEY_SIZE};

const FILE_KEY_AAD: &[u8] = b"cvault-file-key-v1";

/// Vault key id for a user's master-key wrapping key.
pub fn user_key_id(user_id: u64) -> String {
    format!("user-{user_id}")
}

/// The root-scoped wrapping domain for file keys.
pub struct FileKeyDomain {
    wrap_key: Zeroizing<[u8; KEY_SIZE]>,
}

impl FileKeyDomain {
    pub fn from_root(root: &RootSecret) -> CvaultResult<Self> {
        Ok(Self {
            wrap_key: root.file_wrap_key()?,
        })
    }

    pub fn wrap_file_key(&self, file_key: &FileKey) -> CvaultResult<WrappedSecret> {
        Ok(WrappedSecret::from_bytes(aead::seal(
            &self.wrap_key,
            file_key.as_bytes(),
            FILE_KEY_AAD,
        )?))
    }

    pub fn unwrap_file_key(&self, wrapped: &WrappedSecret) -> CvaultResult<FileKey> {
        let raw = aead::open(&self.wrap_key, wrapped.as_bytes(), FILE_KEY_AAD)?;
        Ok(FileKey::from_bytes(to_key_bytes(&raw, "file key")?))
    }
}

impl std::fmt::Debug for FileKeyDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeyDomain")
            .field("wrap_key", &"[REDACTED]")
            .finish()
    }
}

/// Issues and wraps user master keys and file keys.
#[derive(Debug)]
pub struct KeyHierarchy {
    vault: Arc<KeyVault>,
    files: FileKeyDomain,
}

impl KeyHierarchy {
    pub fn new(vault: Arc<KeyVault>, root: &RootSecret) -> CvaultResult<Self> {
        Ok(Self {
            vault,
            files: FileKeyDomain::from_root(root)?,
        })
    }

    pub fn vault(&self) -> &Arc<KeyVault> {
        &self.vault
    }

    /// Allocate the user's vault key and return it with a freshly wrapped master key.
    ///
    /// Fails with `AlreadyExists` if the user already has a vault key.
    pub fn provision_user(&self, user_id: u64) -> CvaultResult<(String, WrappedSecret)> {
        let key_id = user_key_id(user_id);
        self.vault.create_key(&key_id)?;

        let master = generate_master_key();
        let wrapped = self.vault.wrap(master.as_bytes(), &key_id)?;

        tracing::info!(user_id, key_id = %key_id, "user key hierarchy provisioned");
        Ok((key_id, wrapped))
    }

    pub fn unwrap_master_key(
        &self,
        key_id: &str,
        wrapped: &WrappedSecret,
    ) -> CvaultResult<MasterKey> {
        let raw = self.vault.unwrap(wrapped, key_id)?;
        Ok(MasterKey::from_bytes(to_key_bytes(&raw, "master key")?))
    }

    /// Generate a new file key and its wrapped form.
    pub fn new_file_key(&self) -> CvaultResult<(FileKey, WrappedSecret)> {
        let key = generate_file_key();
        let wrapped = self.files.wrap_file_key(&key)?;
        Ok((key, wrapped))
    }

    pub fn wrap_file_key(&self, file_key: &FileKey) -> CvaultResult<WrappedSecret> {
        self.files.wrap_file_key(file_key)
    }

    pub fn unwrap_file_key(&self, wrapped: &WrappedSecret) -> CvaultResult<FileKey> {
        self.files.unwrap_file_key(wrapped)
    }
}

fn to_key_bytes(raw: &[u8], what: &str) -> CvaultResult<[u8; KEY_SIZE]> {
    raw.try_into().map_err(|_| {
        CvaultError::AuthenticationFailure(format!(
            "unwrapped {what} has {} bytes, expected {KEY_SIZE}",
            raw.len()
        ))
    })
}
