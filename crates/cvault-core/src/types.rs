use serde::{Deserialize, Serialize};

/// Opaque wrapped secret: `nonce ‖ auth tag ‖ ciphertext`.
///
/// Serialized as base64 so it can sit next to plain metadata.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedSecret(#[serde(with = "b64")] Vec<u8>);

impl WrappedSecret {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for WrappedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrappedSecret({} bytes)", self.0.len())
    }
}

/// Which transform stage ran before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    #[default]
    Identity,
    Accelerated,
}

impl TransformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::Identity => "identity",
            TransformKind::Accelerated => "accelerated",
        }
    }
}

/// Who produced a chunk's ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSource {
    Remote,
    LocalFallback,
}

impl ChunkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkSource::Remote => "remote",
            ChunkSource::LocalFallback => "local_fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyWrapAlgo {
    #[default]
    #[serde(rename = "AESGCM-v1")]
    AesGcmV1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileEncAlgo {
    #[default]
    #[serde(rename = "XCHACHA20-POLY1305")]
    XChaCha20Poly1305,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    InProgress,
    Success,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::InProgress => "in_progress",
            UploadStatus::Success => "success",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Upload,
    Download,
    KeyUnwrap,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Upload => "upload",
            AuditAction::Download => "download",
            AuditAction::KeyUnwrap => "key_unwrap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
        }
    }
}

/// A user row, limited to what the key hierarchy needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    /// Named key in the vault that wraps this user's master key
    pub kms_key_id: String,
    pub wrapped_master_key: WrappedSecret,
    pub key_version: u32,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub id: u64,
    pub owner_id: u64,
    pub name: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    pub bucket_id: u64,
    pub filename: String,
    pub size_bytes: u64,
    pub chunk_count: u32,
    pub chunk_size: u64,
    pub wrapped_file_key: WrappedSecret,
    pub key_wrap_algo: KeyWrapAlgo,
    pub file_enc_algo: FileEncAlgo,
    pub version: u32,
    pub created_at: u64,
}

/// Public view of a file, without key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: u64,
    pub bucket_id: u64,
    pub filename: String,
    pub size_bytes: u64,
    pub chunk_count: u32,
    pub version: u32,
    pub created_at: u64,
}

impl From<&FileRecord> for FileMetadata {
    fn from(f: &FileRecord) -> Self {
        Self {
            file_id: f.id,
            bucket_id: f.bucket_id,
            filename: f.filename.clone(),
            size_bytes: f.size_bytes,
            chunk_count: f.chunk_count,
            version: f.version,
            created_at: f.created_at,
        }
    }
}

/// One persisted, encrypted chunk of a file. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub file_id: u64,
    /// Zero-based position in split order
    pub index: u32,
    /// Object path relative to the store root
    pub object_key: String,
    /// Stored byte count (ciphertext + tag)
    pub size_bytes: u64,
    /// BLAKE3 of the stored bytes (hex)
    pub digest: String,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    pub algo_version: String,
    pub transform: TransformKind,
    pub source: ChunkSource,
    /// The chunk was submitted to the offload queue
    pub offload_used: bool,
    pub stored_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: u64,
    pub file_id: u64,
    pub status: UploadStatus,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub offload_used: bool,
    #[serde(default)]
    pub remote_chunks: u32,
    #[serde(default)]
    pub fallback_chunks: u32,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: u64,
    pub file_id: u64,
    pub status: UploadStatus,
    pub started_at: u64,
    pub finished_at: Option<u64>,
}

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub user_id: u64,
    pub file_id: Option<u64>,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub note: String,
    pub created_at: u64,
}

/// Result of a successful `store_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub file_id: u64,
    pub filename: String,
    pub chunk_count: u32,
}

/// Current Unix timestamp in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// serde helper: `Vec<u8>` as standard base64.
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_secret_serializes_as_base64() {
        let w = WrappedSecret::from_bytes(vec![0, 1, 2, 255]);
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, "\"AAEC/w==\"");
        let back: WrappedSecret = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn wrapped_secret_debug_hides_bytes() {
        let w = WrappedSecret::from_bytes(vec![7u8; 60]);
        assert_eq!(format!("{w:?}"), "WrappedSecret(60 bytes)");
    }

    #[test]
    fn enum_wire_names() {
        assert_eq!(
            serde_json::to_string(&UploadStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&ChunkSource::LocalFallback).unwrap(),
            "\"local_fallback\""
        );
        assert_eq!(
            serde_json::to_string(&KeyWrapAlgo::AesGcmV1).unwrap(),
            "\"AESGCM-v1\""
        );
        assert!(UploadStatus::Failed.is_terminal());
        assert!(!UploadStatus::InProgress.is_terminal());
    }

    #[test]
    fn as_str_matches_wire_names() {
        for status in [UploadStatus::InProgress, UploadStatus::Success, UploadStatus::Failed] {
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
        for action in [AuditAction::Upload, AuditAction::Download, AuditAction::KeyUnwrap] {
            assert_eq!(
                serde_json::to_string(&action).unwrap(),
                format!("\"{}\"", action.as_str())
            );
        }
        assert_eq!(ChunkSource::Remote.as_str(), "remote");
        assert_eq!(TransformKind::Accelerated.as_str(), "accelerated");
        assert_eq!(AuditOutcome::Failure.as_str(), "failure");
    }
}
