//! Chunk job queue contract and the in-process worker pool
//!
//! A queue accepts a [`ChunkJob`] and hands back a [`JobHandle`] that resolves
//! once a worker reports the job `finished` or `failed`. Callers never poll:
//! the handle completes on the worker's status transition.
//!
//! Jobs carry the *wrapped* file key. Workers unwrap it with the root-derived
//! [`FileKeyDomain`], so the raw key never crosses a process boundary.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Semaphore};

use cvault_core::types::{b64, TransformKind, WrappedSecret};
use cvault_core::{CvaultError, CvaultResult};
use cvault_crypto::{
    decrypt_chunk, ChunkContext, ChunkProcessor, ChunkResult, FileKey, FileKeyDomain, NONCE_SIZE,
    TAG_SIZE,
};

// ── Wire records ──────────────────────────────────────────────────────────

/// One unit of offloaded work: process a single chunk of a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkJob {
    pub job_id: String,
    pub file_id: u64,
    pub index: u32,
    pub wrapped_file_key: WrappedSecret,
    pub transform: TransformKind,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
}

impl ChunkJob {
    pub fn new(
        file_id: u64,
        index: u32,
        wrapped_file_key: WrappedSecret,
        transform: TransformKind,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            file_id,
            index,
            wrapped_file_key,
            transform,
            payload,
        }
    }

    pub fn context(&self) -> ChunkContext {
        ChunkContext {
            file_id: self.file_id,
            index: self.index,
        }
    }

    pub fn to_bytes(&self) -> CvaultResult<bytes::Bytes> {
        let json = serde_json::to_vec(self)
            .map_err(|e| CvaultError::Other(anyhow::anyhow!("serializing ChunkJob: {e}")))?;
        Ok(bytes::Bytes::from(json))
    }

    pub fn from_bytes(data: &[u8]) -> CvaultResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CvaultError::InvalidInput(format!("deserializing ChunkJob: {e}")))
    }
}

/// Fixed result record a worker sends back for a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChunkResult {
    pub index: u32,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    pub digest: String,
    pub size: u64,
    pub transform: TransformKind,
}

impl From<ChunkResult> for RemoteChunkResult {
    fn from(r: ChunkResult) -> Self {
        Self {
            index: r.index,
            nonce: r.nonce.to_vec(),
            tag: r.tag.to_vec(),
            ciphertext: r.ciphertext,
            digest: r.digest,
            size: r.size,
            transform: r.transform,
        }
    }
}

impl RemoteChunkResult {
    /// Structural checks on a worker's result for the chunk at `expected_index`.
    ///
    /// Checks field lengths, the size accounting and recomputes the digest
    /// over `ciphertext || tag`. Anything off is `InvalidInput`. The digest is
    /// computed by the worker, so this cannot tell which chunk or key the
    /// ciphertext belongs to; see [`RemoteChunkResult::authenticate`].
    pub fn into_chunk_result(self, expected_index: u32) -> CvaultResult<ChunkResult> {
        if self.index != expected_index {
            return Err(CvaultError::InvalidInput(format!(
                "result for chunk {} returned for chunk {expected_index}",
                self.index
            )));
        }
        let nonce: [u8; NONCE_SIZE] = self.nonce.as_slice().try_into().map_err(|_| {
            CvaultError::InvalidInput(format!("nonce has {} bytes", self.nonce.len()))
        })?;
        let tag: [u8; TAG_SIZE] = self.tag.as_slice().try_into().map_err(|_| {
            CvaultError::InvalidInput(format!("tag has {} bytes", self.tag.len()))
        })?;

        let result = ChunkResult {
            index: self.index,
            nonce,
            tag,
            ciphertext: self.ciphertext,
            digest: self.digest,
            size: self.size,
            transform: self.transform,
        };
        if !result.verify() {
            return Err(CvaultError::InvalidInput(format!(
                "chunk {expected_index}: size or digest does not match the returned bytes"
            )));
        }
        Ok(result)
    }

    /// Structural checks, then a trial decryption under `file_key` with the
    /// AAD of `ctx`. A result sealed for another chunk, another file or under
    /// another key fails with `AuthenticationFailure`.
    pub fn authenticate(self, file_key: &FileKey, ctx: ChunkContext) -> CvaultResult<ChunkResult> {
        let result = self.into_chunk_result(ctx.index)?;
        decrypt_chunk(
            file_key,
            ctx.index as u64,
            ctx.file_id,
            &result.nonce,
            &result.sealed_bytes(),
        )?;
        Ok(result)
    }
}

/// Terminal status a worker reports for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobReport {
    Finished {
        job_id: String,
        result: RemoteChunkResult,
    },
    Failed {
        job_id: String,
        reason: String,
    },
}

impl JobReport {
    pub fn job_id(&self) -> &str {
        match self {
            JobReport::Finished { job_id, .. } => job_id,
            JobReport::Failed { job_id, .. } => job_id,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            JobReport::Finished { .. } => "finished",
            JobReport::Failed { .. } => "failed",
        }
    }

    pub fn to_bytes(&self) -> CvaultResult<bytes::Bytes> {
        let json = serde_json::to_vec(self)
            .map_err(|e| CvaultError::Other(anyhow::anyhow!("serializing JobReport: {e}")))?;
        Ok(bytes::Bytes::from(json))
    }

    pub fn from_bytes(data: &[u8]) -> CvaultResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CvaultError::InvalidInput(format!("deserializing JobReport: {e}")))
    }
}

// ── Queue contract ────────────────────────────────────────────────────────

/// Resolves once with the job's terminal report.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: String,
    report: oneshot::Receiver<JobReport>,
}

impl JobHandle {
    pub fn new(job_id: String, report: oneshot::Receiver<JobReport>) -> Self {
        Self { job_id, report }
    }

    /// Wait for the report. Dropping the returned future abandons the job:
    /// a late report is discarded.
    pub async fn wait(self) -> CvaultResult<JobReport> {
        self.report.await.map_err(|_| {
            CvaultError::Other(anyhow::anyhow!(
                "job {} was dropped by the queue without a report",
                self.job_id
            ))
        })
    }
}

/// An external (or in-process) pool that runs chunk jobs.
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enqueue a job. Returns as soon as the job is accepted, not when it completes.
    fn submit(&self, job: ChunkJob) -> BoxFuture<'_, CvaultResult<JobHandle>>;
}

/// Run one job to its report. Shared by every worker implementation.
pub fn execute_job(job: &ChunkJob, files: &FileKeyDomain, processor: &ChunkProcessor) -> JobReport {
    let outcome = files
        .unwrap_file_key(&job.wrapped_file_key)
        .and_then(|key| processor.process(&key, job.context(), &job.payload, job.transform));

    match outcome {
        Ok(result) => JobReport::Finished {
            job_id: job.job_id.clone(),
            result: result.into(),
        },
        Err(e) => JobReport::Failed {
            job_id: job.job_id.clone(),
            reason: format!("{}: {e}", e.kind()),
        },
    }
}

// ── In-process pool ───────────────────────────────────────────────────────

/// Worker pool on tokio's blocking threads with bounded concurrency.
pub struct LocalWorkerPool {
    files: Arc<FileKeyDomain>,
    processor: Arc<ChunkProcessor>,
    permits: Arc<Semaphore>,
}

impl LocalWorkerPool {
    pub fn new(files: Arc<FileKeyDomain>, processor: Arc<ChunkProcessor>, workers: usize) -> Self {
        Self {
            files,
            processor,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }
}

impl JobQueue for LocalWorkerPool {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit(&self, job: ChunkJob) -> BoxFuture<'_, CvaultResult<JobHandle>> {
        let (tx, rx) = oneshot::channel();
        let handle = JobHandle::new(job.job_id.clone(), rx);
        let files = Arc::clone(&self.files);
        let processor = Arc::clone(&self.processor);
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let job_id = job.job_id.clone();
            let report = match tokio::task::spawn_blocking(move || {
                execute_job(&job, &files, &processor)
            })
            .await
            {
                Ok(report) => report,
                Err(e) => JobReport::Failed {
                    job_id,
                    reason: format!("worker task panicked: {e}"),
                },
            };
            // Receiver gone means the dispatcher already gave up on this job.
            let _ = tx.send(report);
        });

        Box::pin(async move { Ok(handle) })
    }
}
