//! Offload dispatcher
//!
//! Fans every chunk of an upload out to the job queue up front, then waits on
//! each job independently under its own deadline. A chunk whose job fails,
//! times out or returns a result that does not decrypt under the file key for
//! that chunk is reprocessed in-process. Results come back addressed by chunk
//! index, never by arrival order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use cvault_chunks::ChunkSpan;
use cvault_core::types::{ChunkSource, TransformKind, WrappedSecret};
use cvault_core::{CvaultError, CvaultResult};
use cvault_crypto::{ChunkContext, ChunkProcessor, ChunkResult, FileKey};

use crate::queue::{ChunkJob, JobHandle, JobQueue, JobReport, RemoteChunkResult};

/// One chunk's processing outcome and who produced it.
#[derive(Debug, Clone)]
pub struct DispatchedChunk {
    pub result: ChunkResult,
    pub source: ChunkSource,
    /// A job for this chunk was accepted by the queue
    pub offloaded: bool,
}

/// Inputs shared by every chunk of one file.
pub struct DispatchRequest<'a> {
    pub file_id: u64,
    pub file_key: Arc<FileKey>,
    pub wrapped_file_key: &'a WrappedSecret,
    pub transform: TransformKind,
    pub content: &'a Bytes,
    pub spans: &'a [ChunkSpan],
}

pub struct OffloadDispatcher {
    queue: Option<Arc<dyn JobQueue>>,
    processor: Arc<ChunkProcessor>,
    per_job_timeout: Duration,
}

impl OffloadDispatcher {
    pub fn new(
        queue: Option<Arc<dyn JobQueue>>,
        processor: Arc<ChunkProcessor>,
        per_job_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            per_job_timeout,
        }
    }

    /// Process every chunk locally; no queue.
    pub fn local_only(processor: Arc<ChunkProcessor>) -> Self {
        Self::new(None, processor, Duration::ZERO)
    }

    pub fn processor(&self) -> &Arc<ChunkProcessor> {
        &self.processor
    }

    pub fn offload_enabled(&self) -> bool {
        self.queue.is_some()
    }

    pub fn per_job_timeout(&self) -> Duration {
        self.per_job_timeout
    }

    /// Produce a result for every span, in span order.
    ///
    /// Queue unavailability never fails the call; only an error from local
    /// processing does.
    pub async fn dispatch(&self, req: DispatchRequest<'_>) -> CvaultResult<Vec<DispatchedChunk>> {
        let started = Instant::now();
        let handles = self.submit_all(&req).await;

        let resolved = join_all(
            req.spans
                .iter()
                .zip(handles)
                .map(|(span, handle)| self.resolve(&req, *span, handle)),
        )
        .await;
        let chunks = resolved.into_iter().collect::<CvaultResult<Vec<_>>>()?;

        let remote = chunks
            .iter()
            .filter(|c| c.source == ChunkSource::Remote)
            .count();
        debug!(
            file_id = req.file_id,
            chunks = chunks.len(),
            remote,
            fallback = chunks.len() - remote,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dispatch complete"
        );
        Ok(chunks)
    }

    /// Submit one job per span concurrently. A span whose submit failed gets `None`.
    async fn submit_all(&self, req: &DispatchRequest<'_>) -> Vec<Option<JobHandle>> {
        let Some(queue) = &self.queue else {
            return req.spans.iter().map(|_| None).collect();
        };

        join_all(req.spans.iter().map(|span| {
            let job = ChunkJob::new(
                req.file_id,
                span.index,
                req.wrapped_file_key.clone(),
                req.transform,
                span.slice(req.content).to_vec(),
            );
            let file_id = req.file_id;
            let index = span.index;
            async move {
                match queue.submit(job).await {
                    Ok(handle) => {
                        debug!(
                            file_id,
                            index,
                            job_id = %handle.job_id,
                            queue = queue.name(),
                            "chunk job submitted"
                        );
                        Some(handle)
                    }
                    Err(e) => {
                        warn!(
                            file_id,
                            index,
                            error = %e,
                            "chunk job submit failed, will process locally"
                        );
                        None
                    }
                }
            }
        }))
        .await
    }

    async fn resolve(
        &self,
        req: &DispatchRequest<'_>,
        span: ChunkSpan,
        handle: Option<JobHandle>,
    ) -> CvaultResult<DispatchedChunk> {
        let offloaded = handle.is_some();

        if let Some(handle) = handle {
            let job_id = handle.job_id.clone();
            match tokio::time::timeout(self.per_job_timeout, handle.wait()).await {
                Ok(Ok(JobReport::Finished { result, .. })) => {
                    match self.authenticate_remote(req, span, result).await {
                        Ok(result) => {
                            return Ok(DispatchedChunk {
                                result,
                                source: ChunkSource::Remote,
                                offloaded,
                            })
                        }
                        Err(e) => warn!(
                            file_id = req.file_id,
                            index = span.index,
                            job_id = %job_id,
                            error = %e,
                            "remote result rejected, falling back to local processing"
                        ),
                    }
                }
                Ok(Ok(JobReport::Failed { reason, .. })) => warn!(
                    file_id = req.file_id,
                    index = span.index,
                    job_id = %job_id,
                    reason = %reason,
                    "remote job failed, falling back to local processing"
                ),
                Ok(Err(e)) => warn!(
                    file_id = req.file_id,
                    index = span.index,
                    job_id = %job_id,
                    error = %e,
                    "remote job lost, falling back to local processing"
                ),
                Err(_) => warn!(
                    file_id = req.file_id,
                    index = span.index,
                    job_id = %job_id,
                    timeout_ms = self.per_job_timeout.as_millis() as u64,
                    "remote job timed out, falling back to local processing"
                ),
            }
        }

        let result = self.process_locally(req, span).await?;
        Ok(DispatchedChunk {
            result,
            source: ChunkSource::LocalFallback,
            offloaded,
        })
    }

    /// Check a worker's result against this chunk's key and AAD off the runtime threads.
    async fn authenticate_remote(
        &self,
        req: &DispatchRequest<'_>,
        span: ChunkSpan,
        result: RemoteChunkResult,
    ) -> CvaultResult<ChunkResult> {
        let file_key = Arc::clone(&req.file_key);
        let ctx = ChunkContext {
            file_id: req.file_id,
            index: span.index,
        };
        tokio::task::spawn_blocking(move || result.authenticate(&file_key, ctx))
            .await
            .map_err(|e| CvaultError::Other(anyhow::anyhow!("result check task failed: {e}")))?
    }

    /// In-process fallback. An unavailable accelerator degrades to identity
    /// here, with a warning, so the chunk still gets a result.
    async fn process_locally(
        &self,
        req: &DispatchRequest<'_>,
        span: ChunkSpan,
    ) -> CvaultResult<ChunkResult> {
        let ctx = ChunkContext {
            file_id: req.file_id,
            index: span.index,
        };
        let data = req.content.slice(span.range());

        match self
            .run_blocking(Arc::clone(&req.file_key), ctx, data.clone(), req.transform)
            .await
        {
            Err(CvaultError::TransformUnavailable(msg))
                if req.transform != TransformKind::Identity =>
            {
                warn!(
                    file_id = req.file_id,
                    index = span.index,
                    reason = %msg,
                    "accelerated transform unavailable locally, using identity"
                );
                self.run_blocking(Arc::clone(&req.file_key), ctx, data, TransformKind::Identity)
                    .await
            }
            other => other,
        }
    }

    async fn run_blocking(
        &self,
        file_key: Arc<FileKey>,
        ctx: ChunkContext,
        data: Bytes,
        transform: TransformKind,
    ) -> CvaultResult<ChunkResult> {
        let processor = Arc::clone(&self.processor);
        tokio::task::spawn_blocking(move || processor.process(&file_key, ctx, &data, transform))
            .await
            .map_err(|e| CvaultError::Other(anyhow::anyhow!("local chunk task failed: {e}")))?
    }
}
