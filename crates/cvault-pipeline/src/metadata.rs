//! Metadata store: users, buckets, files, uploads, chunks and the audit log
//!
//! A single JSON document, loaded at open and rewritten atomically (write to
//! a temp file, then rename) after every mutation. Ids are per-table and
//! monotonically increasing. Chunk records and audit entries are append-only.
//! A mutation becomes visible only once its flush has succeeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use cvault_core::types::{
    unix_now, AuditAction, AuditEntry, AuditOutcome, Bucket, ChunkRecord, DownloadRecord,
    FileEncAlgo, FileRecord, KeyWrapAlgo, UploadRecord, UploadStatus, UserRecord, WrappedSecret,
};
use cvault_core::{CvaultError, CvaultResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MetadataDb {
    users: BTreeMap<u64, UserRecord>,
    buckets: BTreeMap<u64, Bucket>,
    files: BTreeMap<u64, FileRecord>,
    uploads: BTreeMap<u64, UploadRecord>,
    downloads: BTreeMap<u64, DownloadRecord>,
    /// file id → chunk records in index order
    chunks: BTreeMap<u64, Vec<ChunkRecord>>,
    audit: Vec<AuditEntry>,
}

fn next_id<V>(table: &BTreeMap<u64, V>) -> u64 {
    table.keys().next_back().map_or(1, |last| last + 1)
}

impl MetadataDb {
    fn finalize_upload(
        &mut self,
        upload_id: u64,
        status: UploadStatus,
        summary: UploadSummary,
    ) -> CvaultResult<UploadRecord> {
        if !status.is_terminal() {
            return Err(CvaultError::Metadata(format!(
                "upload {upload_id} cannot be finalized as {status:?}"
            )));
        }
        let upload = self
            .uploads
            .get_mut(&upload_id)
            .ok_or_else(|| CvaultError::NotFound(format!("upload {upload_id}")))?;
        if upload.status != UploadStatus::InProgress {
            return Err(CvaultError::Metadata(format!(
                "upload {upload_id} is already {:?}",
                upload.status
            )));
        }
        upload.status = status;
        upload.finished_at = Some(unix_now());
        upload.offload_used = summary.offload_used;
        upload.remote_chunks = summary.remote_chunks;
        upload.fallback_chunks = summary.fallback_chunks;
        upload.notes = summary.notes;
        Ok(upload.clone())
    }

    fn finalize_download(
        &mut self,
        download_id: u64,
        status: UploadStatus,
    ) -> CvaultResult<DownloadRecord> {
        let download = self
            .downloads
            .get_mut(&download_id)
            .ok_or_else(|| CvaultError::NotFound(format!("download {download_id}")))?;
        if download.status.is_terminal() {
            return Err(CvaultError::Metadata(format!(
                "download {download_id} is already {:?}",
                download.status
            )));
        }
        download.status = status;
        download.finished_at = Some(unix_now());
        Ok(download.clone())
    }

    fn push_audit(&mut self, audit: NewAudit) -> AuditEntry {
        let entry = AuditEntry {
            id: self.audit.last().map_or(1, |e| e.id + 1),
            user_id: audit.user_id,
            file_id: audit.file_id,
            action: audit.action,
            outcome: audit.outcome,
            note: audit.note,
            created_at: unix_now(),
        };
        self.audit.push(entry.clone());
        entry
    }
}

fn log_audit(entry: &AuditEntry) {
    tracing::info!(
        target: "cvault::audit",
        audit_id = entry.id,
        user_id = entry.user_id,
        file_id = entry.file_id,
        action = entry.action.as_str(),
        outcome = entry.outcome.as_str(),
        note = %entry.note,
        "audit"
    );
}

/// Fields of a new file row. Id, version and timestamp are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub bucket_id: u64,
    pub filename: String,
    pub size_bytes: u64,
    pub chunk_count: u32,
    pub chunk_size: u64,
    pub wrapped_file_key: WrappedSecret,
}

/// Counters recorded when an upload reaches a terminal status.
#[derive(Debug, Clone, Default)]
pub struct UploadSummary {
    pub offload_used: bool,
    pub remote_chunks: u32,
    pub fallback_chunks: u32,
    pub notes: Option<String>,
}

/// Fields of a new audit entry. Id and timestamp are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAudit {
    pub user_id: u64,
    pub file_id: Option<u64>,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub note: String,
}

pub struct MetadataStore {
    path: Option<PathBuf>,
    db: Mutex<MetadataDb>,
}

impl MetadataStore {
    /// Open (or create) the store at `path`. An unparseable file is an error.
    pub fn open(path: impl AsRef<Path>) -> CvaultResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                CvaultError::Metadata(format!("parsing metadata {}: {e}", path.display()))
            })?
        } else {
            MetadataDb::default()
        };
        Ok(Self {
            path: Some(path),
            db: Mutex::new(db),
        })
    }

    /// Non-persistent store, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            db: Mutex::new(MetadataDb::default()),
        }
    }

    // ── Users & buckets ───────────────────────────────────────────────────

    /// Allocate a user id and create the row from the key material `provision` returns.
    ///
    /// `provision` runs with the store locked, so ids are never handed out twice.
    pub fn create_user_with<F>(&self, provision: F) -> CvaultResult<UserRecord>
    where
        F: FnOnce(u64) -> CvaultResult<(String, WrappedSecret)>,
    {
        self.commit(|db| {
            let id = next_id(&db.users);
            let (kms_key_id, wrapped_master_key) = provision(id)?;
            let user = UserRecord {
                id,
                kms_key_id,
                wrapped_master_key,
                key_version: 1,
                created_at: unix_now(),
            };
            db.users.insert(id, user.clone());
            Ok(user)
        })
    }

    pub fn get_user(&self, user_id: u64) -> CvaultResult<UserRecord> {
        self.lock()?
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| CvaultError::NotFound(format!("user {user_id}")))
    }

    /// Vault key id holding the user's master-key wrapping key.
    pub fn user_master_key_id(&self, user_id: u64) -> CvaultResult<String> {
        Ok(self.get_user(user_id)?.kms_key_id)
    }

    pub fn create_bucket(&self, owner_id: u64, name: &str) -> CvaultResult<Bucket> {
        self.commit(|db| {
            if !db.users.contains_key(&owner_id) {
                return Err(CvaultError::NotFound(format!("user {owner_id}")));
            }
            if db
                .buckets
                .values()
                .any(|b| b.owner_id == owner_id && b.name == name)
            {
                return Err(CvaultError::AlreadyExists(format!(
                    "bucket '{name}' for user {owner_id}"
                )));
            }
            let bucket = Bucket {
                id: next_id(&db.buckets),
                owner_id,
                name: name.to_string(),
                created_at: unix_now(),
            };
            db.buckets.insert(bucket.id, bucket.clone());
            Ok(bucket)
        })
    }

    pub fn get_bucket(&self, bucket_id: u64) -> CvaultResult<Bucket> {
        self.lock()?
            .buckets
            .get(&bucket_id)
            .cloned()
            .ok_or_else(|| CvaultError::NotFound(format!("bucket {bucket_id}")))
    }

    // ── Files ─────────────────────────────────────────────────────────────

    /// Insert a file row. Re-using a filename in the same bucket yields the next version.
    pub fn create_file(&self, new: NewFile) -> CvaultResult<FileRecord> {
        self.commit(|db| {
            let version = db
                .files
                .values()
                .filter(|f| f.bucket_id == new.bucket_id && f.filename == new.filename)
                .map(|f| f.version)
                .max()
                .map_or(1, |v| v + 1);

            let file = FileRecord {
                id: next_id(&db.files),
                bucket_id: new.bucket_id,
                filename: new.filename,
                size_bytes: new.size_bytes,
                chunk_count: new.chunk_count,
                chunk_size: new.chunk_size,
                wrapped_file_key: new.wrapped_file_key,
                key_wrap_algo: KeyWrapAlgo::AesGcmV1,
                file_enc_algo: FileEncAlgo::XChaCha20Poly1305,
                version,
                created_at: unix_now(),
            };
            db.files.insert(file.id, file.clone());
            Ok(file)
        })
    }

    pub fn get_file(&self, file_id: u64) -> CvaultResult<FileRecord> {
        self.lock()?
            .files
            .get(&file_id)
            .cloned()
            .ok_or_else(|| CvaultError::NotFound(format!("file {file_id}")))
    }

    // ── Uploads & downloads ───────────────────────────────────────────────

    pub fn begin_upload(&self, file_id: u64) -> CvaultResult<UploadRecord> {
        self.commit(|db| {
            let upload = UploadRecord {
                id: next_id(&db.uploads),
                file_id,
                status: UploadStatus::InProgress,
                started_at: unix_now(),
                finished_at: None,
                offload_used: false,
                remote_chunks: 0,
                fallback_chunks: 0,
                notes: None,
            };
            db.uploads.insert(upload.id, upload.clone());
            Ok(upload)
        })
    }

    /// Move an in-progress upload to a terminal status and append its audit
    /// entry in one write: either both are recorded or neither is. Finalized
    /// uploads never re-open.
    pub fn finalize_upload_audited(
        &self,
        upload_id: u64,
        status: UploadStatus,
        summary: UploadSummary,
        audit: NewAudit,
    ) -> CvaultResult<(UploadRecord, AuditEntry)> {
        let (upload, entry) = self.commit(|db| {
            let upload = db.finalize_upload(upload_id, status, summary)?;
            Ok((upload, db.push_audit(audit)))
        })?;
        log_audit(&entry);
        Ok((upload, entry))
    }

    /// Uploads of a file, oldest first.
    pub fn uploads_for(&self, file_id: u64) -> CvaultResult<Vec<UploadRecord>> {
        Ok(self
            .lock()?
            .uploads
            .values()
            .filter(|u| u.file_id == file_id)
            .cloned()
            .collect())
    }

    pub fn latest_upload(&self, file_id: u64) -> CvaultResult<Option<UploadRecord>> {
        Ok(self.uploads_for(file_id)?.pop())
    }

    pub fn begin_download(&self, file_id: u64) -> CvaultResult<DownloadRecord> {
        self.commit(|db| {
            let download = DownloadRecord {
                id: next_id(&db.downloads),
                file_id,
                status: UploadStatus::InProgress,
                started_at: unix_now(),
                finished_at: None,
            };
            db.downloads.insert(download.id, download.clone());
            Ok(download)
        })
    }

    /// Finalize a download together with its audit entry, in one write.
    pub fn finalize_download_audited(
        &self,
        download_id: u64,
        status: UploadStatus,
        audit: NewAudit,
    ) -> CvaultResult<(DownloadRecord, AuditEntry)> {
        let (download, entry) = self.commit(|db| {
            let download = db.finalize_download(download_id, status)?;
            Ok((download, db.push_audit(audit)))
        })?;
        log_audit(&entry);
        Ok((download, entry))
    }

    // ── Chunks ────────────────────────────────────────────────────────────

    /// Record a persisted chunk. Each (file, index) is written exactly once.
    pub fn add_chunk(&self, record: ChunkRecord) -> CvaultResult<()> {
        self.commit(|db| {
            let chunks = db.chunks.entry(record.file_id).or_default();
            if chunks.iter().any(|c| c.index == record.index) {
                return Err(CvaultError::AlreadyExists(format!(
                    "chunk {} of file {}",
                    record.index, record.file_id
                )));
            }
            let pos = chunks.partition_point(|c| c.index < record.index);
            chunks.insert(pos, record);
            Ok(())
        })
    }

    /// Chunk records of a file ordered by index.
    pub fn list_chunks(&self, file_id: u64) -> CvaultResult<Vec<ChunkRecord>> {
        Ok(self
            .lock()?
            .chunks
            .get(&file_id)
            .cloned()
            .unwrap_or_default())
    }

    // ── Audit ─────────────────────────────────────────────────────────────

    /// Append an audit entry. Also emitted on the `cvault::audit` tracing target.
    pub fn append_audit(
        &self,
        user_id: u64,
        file_id: Option<u64>,
        action: AuditAction,
        outcome: AuditOutcome,
        note: impl Into<String>,
    ) -> CvaultResult<AuditEntry> {
        let audit = NewAudit {
            user_id,
            file_id,
            action,
            outcome,
            note: note.into(),
        };
        let entry = self.commit(|db| Ok(db.push_audit(audit)))?;
        log_audit(&entry);
        Ok(entry)
    }

    /// Audit entries, optionally limited to one user, oldest first.
    pub fn audit_log(&self, user_id: Option<u64>) -> CvaultResult<Vec<AuditEntry>> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .filter(|e| user_id.map_or(true, |u| e.user_id == u))
            .cloned()
            .collect())
    }

    // ── Persistence ───────────────────────────────────────────────────────

    fn lock(&self) -> CvaultResult<MutexGuard<'_, MetadataDb>> {
        self.db
            .lock()
            .map_err(|_| CvaultError::Metadata("metadata lock poisoned".into()))
    }

    /// Apply `change` to a copy of the database, persist the copy, then swap it in.
    ///
    /// If `change` or the flush fails, the live database is untouched.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut MetadataDb) -> CvaultResult<T>,
    ) -> CvaultResult<T> {
        let mut db = self.lock()?;
        let mut next = db.clone();
        let out = change(&mut next)?;
        self.flush(&next)?;
        *db = next;
        Ok(out)
    }

    fn flush(&self, db: &MetadataDb) -> CvaultResult<()> {
        use std::io::Write;

        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CvaultError::Metadata(format!("creating {}: {e}", parent.display()))
                })?;
            }
        }

        let json = serde_json::to_vec_pretty(db)
            .map_err(|e| CvaultError::Metadata(format!("serializing metadata: {e}")))?;

        // Atomic write: temp file, fsync, then rename
        let tmp_path = path.with_extension("tmp");
        let write_tmp = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()
        };
        write_tmp().map_err(|e| {
            CvaultError::Metadata(format!("writing {}: {e}", tmp_path.display()))
        })?;
        std::fs::rename(&tmp_path, path)
            .map_err(|e| CvaultError::Metadata(format!("renaming {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvault_core::types::{ChunkSource, TransformKind};
    use tempfile::TempDir;

    fn user(store: &MetadataStore) -> UserRecord {
        store
            .create_user_with(|id| {
                Ok((
                    format!("user-{id}"),
                    WrappedSecret::from_bytes(vec![0u8; 60]),
                ))
            })
            .unwrap()
    }

    fn new_file(bucket_id: u64, name: &str) -> NewFile {
        NewFile {
            bucket_id,
            filename: name.into(),
            size_bytes: 10,
            chunk_count: 1,
            chunk_size: 16,
            wrapped_file_key: WrappedSecret::from_bytes(vec![1u8; 60]),
        }
    }

    fn chunk(file_id: u64, index: u32) -> ChunkRecord {
        ChunkRecord {
            file_id,
            index,
            object_key: format!("bucket_1/file_{file_id}/chunk_{index}.bin"),
            size_bytes: 32,
            digest: "00".repeat(32),
            nonce: vec![0u8; 24],
            algo_version: "xchacha20poly1305-v1".into(),
            transform: TransformKind::Identity,
            source: ChunkSource::LocalFallback,
            offload_used: false,
            stored_at: 0,
        }
    }

    #[test]
    fn ids_are_sequential() {
        let store = MetadataStore::in_memory();
        assert_eq!(user(&store).id, 1);
        let u2 = user(&store);
        assert_eq!(u2.id, 2);
        assert_eq!(store.user_master_key_id(2).unwrap(), "user-2");
    }

    #[test]
    fn bucket_requires_owner_and_unique_name() {
        let store = MetadataStore::in_memory();
        assert!(matches!(
            store.create_bucket(1, "photos"),
            Err(CvaultError::NotFound(_))
        ));
        let u = user(&store);
        let b = store.create_bucket(u.id, "photos").unwrap();
        assert_eq!(store.get_bucket(b.id).unwrap().owner_id, u.id);
        assert!(matches!(
            store.create_bucket(u.id, "photos"),
            Err(CvaultError::AlreadyExists(_))
        ));
    }

    #[test]
    fn same_filename_bumps_version() {
        let store = MetadataStore::in_memory();
        let f1 = store.create_file(new_file(1, "a.txt")).unwrap();
        let f2 = store.create_file(new_file(1, "a.txt")).unwrap();
        let other = store.create_file(new_file(2, "a.txt")).unwrap();
        assert_eq!((f1.version, f2.version, other.version), (1, 2, 1));
        assert_ne!(f1.id, f2.id);
    }

    fn audit(outcome: AuditOutcome) -> NewAudit {
        NewAudit {
            user_id: 1,
            file_id: Some(1),
            action: AuditAction::Upload,
            outcome,
            note: "Uploaded a.txt, chunks=1".into(),
        }
    }

    #[test]
    fn finalized_upload_never_reopens() {
        let store = MetadataStore::in_memory();
        let up = store.begin_upload(1).unwrap();
        let (done, entry) = store
            .finalize_upload_audited(
                up.id,
                UploadStatus::Success,
                UploadSummary::default(),
                audit(AuditOutcome::Success),
            )
            .unwrap();
        assert!(done.finished_at.is_some());
        assert_eq!(entry.outcome, AuditOutcome::Success);

        let err = store
            .finalize_upload_audited(
                up.id,
                UploadStatus::Failed,
                UploadSummary::default(),
                audit(AuditOutcome::Failure),
            )
            .unwrap_err();
        assert!(matches!(err, CvaultError::Metadata(_)));
        assert_eq!(
            store.latest_upload(1).unwrap().unwrap().status,
            UploadStatus::Success
        );
        // The rejected finalize left no audit entry behind.
        assert_eq!(store.audit_log(None).unwrap().len(), 1);

        let up2 = store.begin_upload(1).unwrap();
        assert!(store
            .finalize_upload_audited(
                up2.id,
                UploadStatus::InProgress,
                UploadSummary::default(),
                audit(AuditOutcome::Success),
            )
            .is_err());
    }

    #[test]
    fn download_finalizes_once_with_audit() {
        let store = MetadataStore::in_memory();
        let down = store.begin_download(1).unwrap();
        let mut entry = audit(AuditOutcome::Success);
        entry.action = AuditAction::Download;

        let (done, logged) = store
            .finalize_download_audited(down.id, UploadStatus::Success, entry.clone())
            .unwrap();
        assert_eq!(done.status, UploadStatus::Success);
        assert_eq!(logged.action, AuditAction::Download);

        assert!(store
            .finalize_download_audited(down.id, UploadStatus::Failed, entry)
            .is_err());
        assert_eq!(store.audit_log(None).unwrap().len(), 1);
    }

    #[test]
    fn chunks_listed_in_index_order_and_unique() {
        let store = MetadataStore::in_memory();
        for i in [2, 0, 1] {
            store.add_chunk(chunk(7, i)).unwrap();
        }
        let indices: Vec<u32> = store.list_chunks(7).unwrap().iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        assert!(matches!(
            store.add_chunk(chunk(7, 1)),
            Err(CvaultError::AlreadyExists(_))
        ));
        assert!(store.list_chunks(8).unwrap().is_empty());
    }

    #[test]
    fn audit_is_append_only_and_filterable() {
        let store = MetadataStore::in_memory();
        store
            .append_audit(1, Some(3), AuditAction::Upload, AuditOutcome::Success, "Uploaded a, chunks=1")
            .unwrap();
        store
            .append_audit(2, None, AuditAction::Upload, AuditOutcome::Failure, "rejected")
            .unwrap();

        assert_eq!(store.audit_log(None).unwrap().len(), 2);
        let mine = store.audit_log(Some(1)).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, 1);
        assert_eq!(mine[0].file_id, Some(3));
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta/metadata.json");
        {
            let store = MetadataStore::open(&path).unwrap();
            let u = user(&store);
            store.create_bucket(u.id, "b").unwrap();
            store.add_chunk(chunk(1, 0)).unwrap();
        }

        let store = MetadataStore::open(&path).unwrap();
        assert_eq!(store.get_bucket(1).unwrap().name, "b");
        assert_eq!(store.list_chunks(1).unwrap().len(), 1);
        assert_eq!(user(&store).id, 2);
    }

    #[test]
    fn failed_flush_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.json");
        let store = MetadataStore::open(&path).unwrap();
        let u = user(&store);
        let bucket = store.create_bucket(u.id, "b").unwrap();
        let earlier = store.begin_upload(99).unwrap();

        // A directory where the temp file goes makes every flush fail.
        let blocker = dir.path().join("metadata.tmp");
        std::fs::create_dir(&blocker).unwrap();

        assert!(store.create_file(new_file(bucket.id, "a.txt")).is_err());
        assert!(matches!(store.get_file(1), Err(CvaultError::NotFound(_))));

        assert!(store.begin_upload(1).is_err());
        assert!(store.uploads_for(1).unwrap().is_empty());

        assert!(store.add_chunk(chunk(1, 0)).is_err());
        assert!(store.list_chunks(1).unwrap().is_empty());

        assert!(store
            .append_audit(u.id, None, AuditAction::Upload, AuditOutcome::Failure, "x")
            .is_err());
        assert!(store.audit_log(None).unwrap().is_empty());

        assert!(store
            .finalize_upload_audited(
                earlier.id,
                UploadStatus::Success,
                UploadSummary::default(),
                audit(AuditOutcome::Success),
            )
            .is_err());
        assert_eq!(
            store.latest_upload(99).unwrap().unwrap().status,
            UploadStatus::InProgress
        );
        assert!(store.audit_log(None).unwrap().is_empty());

        assert!(store.create_bucket(u.id, "c").is_err());
        assert!(matches!(store.get_bucket(2), Err(CvaultError::NotFound(_))));

        std::fs::remove_dir(&blocker).unwrap();
        let file = store.create_file(new_file(bucket.id, "a.txt")).unwrap();
        assert_eq!((file.id, file.version), (1, 1));
        let upload = store.begin_upload(file.id).unwrap();
        assert_eq!(upload.id, earlier.id + 1);

        let reopened = MetadataStore::open(&path).unwrap();
        assert_eq!(reopened.get_file(1).unwrap().version, 1);
        assert_eq!(reopened.uploads_for(1).unwrap().len(), 1);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            MetadataStore::open(&path),
            Err(CvaultError::Metadata(_))
        ));
    }
}
