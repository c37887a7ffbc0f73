//! Local key vault ("HSM")
//!
//! Holds named 256-bit keys and wraps/unwraps small secrets under them.
//! The whole table is sealed under the root-derived table key and rewritten
//! atomically on every mutation.
//!
//! Persisted file: `nonce(12) || tag(16) || AES-GCM(json {key_id: base64 key})`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroizing;

use cvault_core::types::WrappedSecret;
use cvault_core::{CvaultError, CvaultResult};

use crate::keys::{random_key, RootSecret};
use crate::{aead, KEY_SIZE};

const TABLE_AAD: &[u8] = b"cvault-keytable-v1";

type KeyTable = BTreeMap<String, Zeroizing<[u8; KEY_SIZE]>>;

/// Named-key store. Construct once and share behind an `Arc`.
pub struct KeyVault {
    path: PathBuf,
    table_key: Zeroizing<[u8; KEY_SIZE]>,
    keys: RwLock<KeyTable>,
    /// Serializes create_key so two callers never both persist a table.
    write_lock: Mutex<()>,
}

impl KeyVault {
    /// Open the vault at `path`, decrypting the existing table if present.
    ///
    /// A missing file is an empty vault. A file that cannot be decrypted or
    /// parsed is an error; it is never replaced by an empty table.
    pub fn open(path: impl AsRef<Path>, root: &RootSecret) -> CvaultResult<Self> {
        let path = path.as_ref().to_path_buf();
        let table_key = root.table_key()?;

        let keys = if path.exists() {
            let sealed = std::fs::read(&path)?;
            let table = decode_table(&table_key, &sealed).map_err(|e| match e {
                CvaultError::AuthenticationFailure(msg) => CvaultError::AuthenticationFailure(
                    format!("key table {} could not be decrypted: {msg}", path.display()),
                ),
                other => other,
            })?;
            tracing::info!(path = %path.display(), keys = table.len(), "key vault loaded");
            table
        } else {
            tracing::info!(path = %path.display(), "key vault not found, starting empty");
            KeyTable::new()
        };

        Ok(Self {
            path,
            table_key,
            keys: RwLock::new(keys),
            write_lock: Mutex::new(()),
        })
    }

    /// Generate a fresh key under `key_id` and persist the table.
    ///
    /// Fails with `AlreadyExists` if the id is taken; the table is unchanged.
    pub fn create_key(&self, key_id: &str) -> CvaultResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CvaultError::Other(anyhow::anyhow!("key vault write lock poisoned")))?;

        let mut next = {
            let keys = self.read_keys()?;
            if keys.contains_key(key_id) {
                return Err(CvaultError::AlreadyExists(format!("key id {key_id}")));
            }
            keys.clone()
        };
        next.insert(key_id.to_string(), Zeroizing::new(random_key()));

        self.persist(&next)?;

        *self
            .keys
            .write()
            .map_err(|_| CvaultError::Other(anyhow::anyhow!("key vault table lock poisoned")))? =
            next;

        tracing::info!(key_id, "vault key created");
        Ok(())
    }

    /// Encrypt `secret` under the named key.
    pub fn wrap(&self, secret: &[u8], key_id: &str) -> CvaultResult<WrappedSecret> {
        let keys = self.read_keys()?;
        let key = keys
            .get(key_id)
            .ok_or_else(|| CvaultError::UnknownKey(key_id.to_string()))?;
        Ok(WrappedSecret::from_bytes(aead::seal(
            key,
            secret,
            key_id.as_bytes(),
        )?))
    }

    /// Decrypt and verify a secret sealed by [`KeyVault::wrap`] under the same key.
    pub fn unwrap(
        &self,
        wrapped: &WrappedSecret,
        key_id: &str,
    ) -> CvaultResult<Zeroizing<Vec<u8>>> {
        let keys = self.read_keys()?;
        let key = keys
            .get(key_id)
            .ok_or_else(|| CvaultError::UnknownKey(key_id.to_string()))?;
        aead::open(key, wrapped.as_bytes(), key_id.as_bytes())
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.read_keys()
            .map(|keys| keys.contains_key(key_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.read_keys().map(|keys| keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_keys(&self) -> CvaultResult<std::sync::RwLockReadGuard<'_, KeyTable>> {
        self.keys
            .read()
            .map_err(|_| CvaultError::Other(anyhow::anyhow!("key vault table lock poisoned")))
    }

    fn persist(&self, table: &KeyTable) -> CvaultResult<()> {
        let encoded: BTreeMap<&str, String> = table
            .iter()
            .map(|(id, key)| (id.as_str(), STANDARD.encode(key.as_slice())))
            .collect();
        let json = Zeroizing::new(
            serde_json::to_vec(&encoded)
                .map_err(|e| CvaultError::Other(anyhow::anyhow!("serializing key table: {e}")))?,
        );
        let sealed = aead::seal(&self.table_key, &json, TABLE_AAD)?;
        write_atomic(&self.path, &sealed)
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("path", &self.path)
            .field("keys", &self.len())
            .finish()
    }
}

fn decode_table(table_key: &[u8; KEY_SIZE], sealed: &[u8]) -> CvaultResult<KeyTable> {
    let json = aead::open(table_key, sealed, TABLE_AAD)?;
    let encoded: BTreeMap<String, String> = serde_json::from_slice(&json)
        .map_err(|e| CvaultError::AuthenticationFailure(format!("key table is malformed: {e}")))?;

    let mut table = KeyTable::new();
    for (id, b64) in encoded {
        let raw = Zeroizing::new(STANDARD.decode(b64.as_bytes()).map_err(|e| {
            CvaultError::AuthenticationFailure(format!("key {id} is not base64: {e}"))
        })?);
        if raw.len() != KEY_SIZE {
            return Err(CvaultError::AuthenticationFailure(format!(
                "key {id} has {} bytes, expected {KEY_SIZE}",
                raw.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&raw);
        table.insert(id, key);
    }
    Ok(table)
}

/// Write-to-temp, fsync, rename. Owner-only permissions on unix.
fn write_atomic(path: &Path, bytes: &[u8]) -> CvaultResult<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
