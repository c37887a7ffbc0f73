//! Upload orchestrator
//!
//! Drives one upload through
//! `Created → Chunking → Dispatching → Persisting → Finalized(success|failed)`.
//! Every attempt that reaches the orchestrator leaves exactly one audit entry,
//! written in the same metadata commit as the upload's terminal status.
//! A failed upload keeps whatever chunk records were already written, for
//! diagnosis, but the file is not retrievable.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{info, warn};

use cvault_chunks::{chunk_count, split};
use cvault_core::types::{
    unix_now, AuditAction, AuditOutcome, ChunkRecord, ChunkSource, FileMetadata, FileRecord,
    StoredFile, TransformKind, UploadStatus,
};
use cvault_core::{CvaultError, CvaultResult};
use cvault_crypto::{ChunkContext, KeyHierarchy, CHUNK_ALGO_VERSION};
use cvault_storage::ObjectStore;

use crate::dispatch::{DispatchRequest, DispatchedChunk, OffloadDispatcher};
use crate::metadata::{MetadataStore, NewAudit, NewFile, UploadSummary};

/// Lifecycle of one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Created,
    Chunking,
    Dispatching,
    Persisting,
    Finalized(UploadStatus),
}

impl UploadPhase {
    /// Checked transition. Any live phase may fail; finalized phases never move.
    pub fn advance(self, next: UploadPhase) -> CvaultResult<UploadPhase> {
        use UploadPhase::*;
        let allowed = match (self, next) {
            (Finalized(_), _) => false,
            (_, Finalized(UploadStatus::Failed)) => true,
            (Created, Chunking)
            | (Chunking, Dispatching)
            | (Dispatching, Persisting)
            | (Persisting, Finalized(UploadStatus::Success)) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(CvaultError::Other(anyhow::anyhow!(
                "illegal upload transition {self:?} -> {next:?}"
            )))
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, UploadPhase::Finalized(_))
    }
}

/// Settings fixed for the orchestrator's lifetime.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub chunk_size: usize,
    pub transform: TransformKind,
}

pub struct UploadOrchestrator {
    metadata: Arc<MetadataStore>,
    keys: Arc<KeyHierarchy>,
    store: ObjectStore,
    dispatcher: OffloadDispatcher,
    settings: UploadSettings,
}

/// Per-attempt state carried through the phases.
struct Attempt {
    phase: UploadPhase,
    file_id: Option<u64>,
    upload_id: Option<u64>,
    chunk_count: u32,
    summary: UploadSummary,
}

impl Attempt {
    fn advance(&mut self, next: UploadPhase) -> CvaultResult<()> {
        self.phase = self.phase.advance(next)?;
        Ok(())
    }
}

impl UploadOrchestrator {
    pub fn new(
        metadata: Arc<MetadataStore>,
        keys: Arc<KeyHierarchy>,
        store: ObjectStore,
        dispatcher: OffloadDispatcher,
        settings: UploadSettings,
    ) -> Self {
        Self {
            metadata,
            keys,
            store,
            dispatcher,
            settings,
        }
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn keys(&self) -> &Arc<KeyHierarchy> {
        &self.keys
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Chunk, encrypt and persist `content` as a new file (or new version) in `bucket_id`.
    pub async fn store_file(
        &self,
        bucket_id: u64,
        owner_id: u64,
        filename: &str,
        content: Bytes,
    ) -> CvaultResult<StoredFile> {
        let mut attempt = Attempt {
            phase: UploadPhase::Created,
            file_id: None,
            upload_id: None,
            chunk_count: 0,
            summary: UploadSummary::default(),
        };

        let outcome = self
            .run_upload(bucket_id, owner_id, filename, content, &mut attempt)
            .await;

        match outcome {
            Ok(stored) => {
                info!(
                    file_id = stored.file_id,
                    filename,
                    chunks = stored.chunk_count,
                    remote = attempt.summary.remote_chunks,
                    fallback = attempt.summary.fallback_chunks,
                    "upload finalized: success"
                );
                Ok(stored)
            }
            Err(e) => {
                let note = format!(
                    "Upload of {filename} failed, chunks={}: {e}",
                    attempt.chunk_count
                );
                let upload_id = attempt.upload_id;
                let finalizable = upload_id.is_some()
                    && attempt
                        .advance(UploadPhase::Finalized(UploadStatus::Failed))
                        .is_ok();
                let recorded = match upload_id {
                    Some(upload_id) if finalizable => {
                        let mut summary = attempt.summary.clone();
                        summary.notes = Some(e.to_string());
                        self.metadata
                            .finalize_upload_audited(
                                upload_id,
                                UploadStatus::Failed,
                                summary,
                                NewAudit {
                                    user_id: owner_id,
                                    file_id: attempt.file_id,
                                    action: AuditAction::Upload,
                                    outcome: AuditOutcome::Failure,
                                    note,
                                },
                            )
                            .map(|_| ())
                    }
                    _ => self
                        .metadata
                        .append_audit(
                            owner_id,
                            attempt.file_id,
                            AuditAction::Upload,
                            AuditOutcome::Failure,
                            note,
                        )
                        .map(|_| ()),
                };
                if let Err(meta_err) = recorded {
                    warn!(
                        upload_id = ?attempt.upload_id,
                        error = %meta_err,
                        "could not record upload failure"
                    );
                }
                warn!(
                    file_id = ?attempt.file_id,
                    filename,
                    kind = %e.kind(),
                    fatal = e.is_fatal_for_upload(),
                    error = %e,
                    "upload finalized: failed"
                );
                Err(e)
            }
        }
    }

    async fn run_upload(
        &self,
        bucket_id: u64,
        owner_id: u64,
        filename: &str,
        content: Bytes,
        attempt: &mut Attempt,
    ) -> CvaultResult<StoredFile> {
        let bucket = self.metadata.get_bucket(bucket_id)?;
        if bucket.owner_id != owner_id {
            return Err(CvaultError::Forbidden(format!(
                "bucket {bucket_id} is not owned by user {owner_id}"
            )));
        }

        // Created → Chunking: allocate the file row with its wrapped key.
        let chunk_size = self.settings.chunk_size;
        let count = u32::try_from(chunk_count(content.len(), chunk_size)).map_err(|_| {
            CvaultError::InvalidInput(format!("{filename} has too many chunks"))
        })?;
        let (file_key, wrapped_file_key) = self.keys.new_file_key()?;
        let file = self.metadata.create_file(NewFile {
            bucket_id,
            filename: filename.to_string(),
            size_bytes: content.len() as u64,
            chunk_count: count,
            chunk_size: chunk_size as u64,
            wrapped_file_key: wrapped_file_key.clone(),
        })?;
        attempt.file_id = Some(file.id);
        attempt.chunk_count = count;
        attempt.advance(UploadPhase::Chunking)?;

        let upload = self.metadata.begin_upload(file.id)?;
        attempt.upload_id = Some(upload.id);
        info!(
            file_id = file.id,
            upload_id = upload.id,
            filename,
            version = file.version,
            size = content.len(),
            chunks = count,
            "upload started"
        );

        // Chunking → Dispatching
        let spans = split(&content, chunk_size)?;
        attempt.advance(UploadPhase::Dispatching)?;

        let dispatched = self
            .dispatcher
            .dispatch(DispatchRequest {
                file_id: file.id,
                file_key: Arc::new(file_key),
                wrapped_file_key: &wrapped_file_key,
                transform: self.settings.transform,
                content: &content,
                spans: &spans,
            })
            .await?;

        let remote = dispatched
            .iter()
            .filter(|c| c.source == ChunkSource::Remote)
            .count() as u32;
        attempt.summary = UploadSummary {
            offload_used: dispatched.iter().any(|c| c.offloaded),
            remote_chunks: remote,
            fallback_chunks: dispatched.len() as u32 - remote,
            notes: None,
        };

        // Dispatching → Persisting
        attempt.advance(UploadPhase::Persisting)?;
        self.persist_chunks(bucket.id, &file, dispatched).await?;

        // Persisting → Finalized(success), committed with its audit entry
        self.metadata.finalize_upload_audited(
            upload.id,
            UploadStatus::Success,
            attempt.summary.clone(),
            NewAudit {
                user_id: owner_id,
                file_id: Some(file.id),
                action: AuditAction::Upload,
                outcome: AuditOutcome::Success,
                note: format!("Uploaded {filename}, chunks={count}"),
            },
        )?;
        attempt.advance(UploadPhase::Finalized(UploadStatus::Success))?;

        Ok(StoredFile {
            file_id: file.id,
            filename: file.filename.clone(),
            chunk_count: count,
        })
    }

    /// Write every object concurrently, then record chunks in index order.
    ///
    /// Records are written for every object that landed, even when another
    /// chunk failed; the first write error is returned afterwards.
    async fn persist_chunks(
        &self,
        bucket_id: u64,
        file: &FileRecord,
        dispatched: Vec<DispatchedChunk>,
    ) -> CvaultResult<()> {
        let writes = join_all(dispatched.iter().map(|chunk| {
            self.store.put_chunk(
                bucket_id,
                file.id,
                chunk.result.index,
                chunk.result.sealed_bytes(),
            )
        }))
        .await;

        let mut first_error = None;
        for (chunk, written) in dispatched.into_iter().zip(writes) {
            match written {
                Ok(object_key) => {
                    self.metadata.add_chunk(ChunkRecord {
                        file_id: file.id,
                        index: chunk.result.index,
                        object_key,
                        size_bytes: chunk.result.size,
                        digest: chunk.result.digest,
                        nonce: chunk.result.nonce.to_vec(),
                        algo_version: CHUNK_ALGO_VERSION.to_string(),
                        transform: chunk.result.transform,
                        source: chunk.source,
                        offload_used: chunk.offloaded,
                        stored_at: unix_now(),
                    })?;
                }
                Err(e) => {
                    warn!(
                        file_id = file.id,
                        index = chunk.result.index,
                        error = %e,
                        "chunk write failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn get_file_metadata(&self, file_id: u64) -> CvaultResult<FileMetadata> {
        Ok(FileMetadata::from(&self.metadata.get_file(file_id)?))
    }

    /// Chunk records of a file, ordered by index.
    pub fn list_chunks(&self, file_id: u64) -> CvaultResult<Vec<ChunkRecord>> {
        self.metadata.get_file(file_id)?;
        self.metadata.list_chunks(file_id)
    }

    /// Read back, verify and decrypt a file owned by `requester_id`.
    pub async fn retrieve_file(&self, file_id: u64, requester_id: u64) -> CvaultResult<Bytes> {
        let file = self.metadata.get_file(file_id)?;
        let bucket = self.metadata.get_bucket(file.bucket_id)?;
        if bucket.owner_id != requester_id {
            return Err(CvaultError::Forbidden(format!(
                "file {file_id} is not owned by user {requester_id}"
            )));
        }
        match self.metadata.latest_upload(file_id)? {
            Some(u) if u.status == UploadStatus::Success => {}
            _ => {
                return Err(CvaultError::NotFound(format!(
                    "file {file_id} has no completed upload"
                )))
            }
        }

        let download = self.metadata.begin_download(file_id)?;
        let outcome = self.read_file(&file).await;
        let (status, audit_outcome, note) = match &outcome {
            Ok(bytes) => (
                UploadStatus::Success,
                AuditOutcome::Success,
                format!("Downloaded {}, bytes={}", file.filename, bytes.len()),
            ),
            Err(e) => (
                UploadStatus::Failed,
                AuditOutcome::Failure,
                format!("Download of {} failed: {e}", file.filename),
            ),
        };
        self.metadata.finalize_download_audited(
            download.id,
            status,
            NewAudit {
                user_id: requester_id,
                file_id: Some(file_id),
                action: AuditAction::Download,
                outcome: audit_outcome,
                note,
            },
        )?;
        outcome
    }

    async fn read_file(&self, file: &FileRecord) -> CvaultResult<Bytes> {
        let records = self.metadata.list_chunks(file.id)?;
        let contiguous = records
            .iter()
            .enumerate()
            .all(|(i, r)| r.index as usize == i);
        if records.len() != file.chunk_count as usize || !contiguous {
            return Err(CvaultError::Metadata(format!(
                "file {} has {} of {} chunk records",
                file.id,
                records.len(),
                file.chunk_count
            )));
        }

        let file_key = self.keys.unwrap_file_key(&file.wrapped_file_key)?;
        let objects = join_all(records.iter().map(|r| self.store.get_chunk(&r.object_key))).await;

        let processor = self.dispatcher.processor();
        let mut out = Vec::with_capacity(file.size_bytes as usize);
        for (record, stored) in records.iter().zip(objects) {
            let plain = processor.open(
                &file_key,
                ChunkContext {
                    file_id: file.id,
                    index: record.index,
                },
                &record.nonce,
                &stored?,
                &record.digest,
                record.transform,
            )?;
            out.extend_from_slice(&plain);
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UploadPhase::*;

    #[test]
    fn happy_path_transitions() {
        let mut phase = Created;
        for next in [Chunking, Dispatching, Persisting, Finalized(UploadStatus::Success)] {
            phase = phase.advance(next).unwrap();
        }
        assert!(phase.is_final());
    }

    #[test]
    fn any_live_phase_can_fail() {
        for phase in [Created, Chunking, Dispatching, Persisting] {
            assert_eq!(
                phase.advance(Finalized(UploadStatus::Failed)).unwrap(),
                Finalized(UploadStatus::Failed)
            );
        }
    }

    #[test]
    fn illegal_transitions_rejected() {
        assert!(Created.advance(Dispatching).is_err());
        assert!(Chunking.advance(Finalized(UploadStatus::Success)).is_err());
        assert!(Persisting.advance(Chunking).is_err());
        assert!(Created.advance(Finalized(UploadStatus::InProgress)).is_err());
    }

    #[test]
    fn finalized_is_terminal() {
        let done = Finalized(UploadStatus::Success);
        assert!(done.advance(Finalized(UploadStatus::Failed)).is_err());
        assert!(Finalized(UploadStatus::Failed).advance(Created).is_err());
    }
}
