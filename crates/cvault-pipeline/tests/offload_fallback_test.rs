//! Offload dispatcher behaviour against misbehaving job queues.
//!
//! Each queue double accepts jobs but then fails them, sits on them, or
//! returns tampered results. Uploads must still succeed with every chunk
//! recorded in index order.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::oneshot;

use cvault_core::types::{ChunkSource, TransformKind, UploadStatus};
use cvault_core::CvaultResult;
use cvault_crypto::{ChunkProcessor, FileKeyDomain, KeyHierarchy, KeyVault, RootSecret};
use cvault_pipeline::{
    execute_job, ChunkJob, JobHandle, JobQueue, JobReport, LocalWorkerPool, MetadataStore,
    OffloadDispatcher, UploadOrchestrator, UploadSettings,
};
use cvault_storage::{memory_operator, ObjectStore};

const ROOT: [u8; 32] = [7u8; 32];

fn domain() -> Arc<FileKeyDomain> {
    Arc::new(FileKeyDomain::from_root(&RootSecret::from_bytes(ROOT)).unwrap())
}

struct Harness {
    _dir: TempDir,
    orch: UploadOrchestrator,
    user_id: u64,
    bucket_id: u64,
}

fn harness(queue: Arc<dyn JobQueue>, timeout: Duration, chunk_size: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = RootSecret::from_bytes(ROOT);
    let vault = KeyVault::open(dir.path().join("vault.keys"), &root).unwrap();
    let keys = Arc::new(KeyHierarchy::new(Arc::new(vault), &root).unwrap());
    let metadata = Arc::new(MetadataStore::in_memory());
    let user = metadata
        .create_user_with(|id| keys.provision_user(id))
        .unwrap();
    let bucket = metadata.create_bucket(user.id, "b").unwrap();

    let dispatcher =
        OffloadDispatcher::new(Some(queue), Arc::new(ChunkProcessor::default()), timeout);
    let orch = UploadOrchestrator::new(
        metadata,
        keys,
        ObjectStore::new(memory_operator().unwrap()),
        dispatcher,
        UploadSettings {
            chunk_size,
            transform: TransformKind::Identity,
        },
    );
    Harness {
        _dir: dir,
        orch,
        user_id: user.id,
        bucket_id: bucket.id,
    }
}

fn content(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<_>>())
}

// ── Queue doubles ─────────────────────────────────────────────────────────

/// Accepts every job and immediately reports it failed.
struct RejectingQueue;

impl JobQueue for RejectingQueue {
    fn name(&self) -> &'static str {
        "rejecting"
    }

    fn submit(&self, job: ChunkJob) -> BoxFuture<'_, CvaultResult<JobHandle>> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(JobReport::Failed {
            job_id: job.job_id.clone(),
            reason: "worker out of memory".into(),
        });
        Box::pin(async move { Ok(JobHandle::new(job.job_id, rx)) })
    }
}

/// Accepts every job and never reports.
#[derive(Default)]
struct HangingQueue {
    parked: Mutex<Vec<oneshot::Sender<JobReport>>>,
}

impl JobQueue for HangingQueue {
    fn name(&self) -> &'static str {
        "hanging"
    }

    fn submit(&self, job: ChunkJob) -> BoxFuture<'_, CvaultResult<JobHandle>> {
        let (tx, rx) = oneshot::channel();
        self.parked.lock().unwrap().push(tx);
        Box::pin(async move { Ok(JobHandle::new(job.job_id, rx)) })
    }
}

/// Runs jobs honestly, then applies `tamper` to odd-indexed chunks.
struct SelectiveQueue {
    files: Arc<FileKeyDomain>,
    processor: ChunkProcessor,
    tamper: fn(JobReport) -> JobReport,
}

impl JobQueue for SelectiveQueue {
    fn name(&self) -> &'static str {
        "selective"
    }

    fn submit(&self, job: ChunkJob) -> BoxFuture<'_, CvaultResult<JobHandle>> {
        let (tx, rx) = oneshot::channel();
        let mut report = execute_job(&job, &self.files, &self.processor);
        if job.index % 2 == 1 {
            report = (self.tamper)(report);
        }
        let _ = tx.send(report);
        Box::pin(async move { Ok(JobHandle::new(job.job_id, rx)) })
    }
}

/// Reports every job after `delay`, except `stall_index`, which never reports.
struct StallingQueue {
    files: Arc<FileKeyDomain>,
    processor: Arc<ChunkProcessor>,
    stall_index: u32,
    delay: Duration,
    parked: Mutex<Vec<oneshot::Sender<JobReport>>>,
}

impl JobQueue for StallingQueue {
    fn name(&self) -> &'static str {
        "stalling"
    }

    fn submit(&self, job: ChunkJob) -> BoxFuture<'_, CvaultResult<JobHandle>> {
        let (tx, rx) = oneshot::channel();
        let job_id = job.job_id.clone();
        if job.index == self.stall_index {
            self.parked.lock().unwrap().push(tx);
        } else {
            let files = Arc::clone(&self.files);
            let processor = Arc::clone(&self.processor);
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(execute_job(&job, &files, &processor));
            });
        }
        Box::pin(async move { Ok(JobHandle::new(job_id, rx)) })
    }
}

fn fail_report(report: JobReport) -> JobReport {
    JobReport::Failed {
        job_id: report.job_id().to_string(),
        reason: "injected".into(),
    }
}

fn flip_ciphertext(report: JobReport) -> JobReport {
    match report {
        JobReport::Finished { job_id, mut result } => {
            result.ciphertext[0] ^= 0x01;
            JobReport::Finished { job_id, result }
        }
        other => other,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn all_remote_failures_still_succeed() {
    let h = harness(Arc::new(RejectingQueue), Duration::from_secs(5), 1000);
    let data = content(4500);

    let stored = h
        .orch
        .store_file(h.bucket_id, h.user_id, "f.bin", data.clone())
        .await
        .unwrap();
    assert_eq!(stored.chunk_count, 5);

    let chunks = h.orch.list_chunks(stored.file_id).unwrap();
    assert_eq!(chunks.len(), 5);
    for chunk in &chunks {
        assert_eq!(chunk.source, ChunkSource::LocalFallback);
        assert!(chunk.offload_used, "chunk {} was accepted by the queue", chunk.index);
    }

    let upload = h.orch.metadata().latest_upload(stored.file_id).unwrap().unwrap();
    assert_eq!(upload.status, UploadStatus::Success);
    assert!(upload.offload_used);
    assert_eq!(upload.remote_chunks, 0);
    assert_eq!(upload.fallback_chunks, 5);

    assert_eq!(h.orch.retrieve_file(stored.file_id, h.user_id).await.unwrap(), data);
}

#[tokio::test]
async fn hanging_queue_is_bounded_by_one_timeout() {
    let timeout = Duration::from_millis(200);
    let h = harness(Arc::new(HangingQueue::default()), timeout, 100);
    let data = content(800);

    let started = Instant::now();
    let stored = h
        .orch
        .store_file(h.bucket_id, h.user_id, "slow.bin", data.clone())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(stored.chunk_count, 8);
    // Eight chunks waited on concurrently, not one after another.
    assert!(elapsed >= timeout, "finished before the timeout: {elapsed:?}");
    assert!(elapsed < timeout * 3, "waits were serialized: {elapsed:?}");

    let chunks = h.orch.list_chunks(stored.file_id).unwrap();
    assert!(chunks
        .iter()
        .all(|c| c.source == ChunkSource::LocalFallback && c.offload_used));
    assert_eq!(h.orch.retrieve_file(stored.file_id, h.user_id).await.unwrap(), data);
}

#[tokio::test]
async fn mixed_sources_keep_index_order() {
    let queue = SelectiveQueue {
        files: domain(),
        processor: ChunkProcessor::default(),
        tamper: fail_report,
    };
    let h = harness(Arc::new(queue), Duration::from_secs(5), 64);
    let data = content(64 * 6 + 10);

    let stored = h
        .orch
        .store_file(h.bucket_id, h.user_id, "mixed.bin", data.clone())
        .await
        .unwrap();

    let chunks = h.orch.list_chunks(stored.file_id).unwrap();
    let indices: Vec<u32> = chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, (0..7).collect::<Vec<_>>());
    for chunk in &chunks {
        let expected = if chunk.index % 2 == 1 {
            ChunkSource::LocalFallback
        } else {
            ChunkSource::Remote
        };
        assert_eq!(chunk.source, expected, "chunk {}", chunk.index);
    }

    let upload = h.orch.metadata().latest_upload(stored.file_id).unwrap().unwrap();
    assert_eq!(upload.remote_chunks, 4);
    assert_eq!(upload.fallback_chunks, 3);
    assert_eq!(h.orch.retrieve_file(stored.file_id, h.user_id).await.unwrap(), data);
}

#[tokio::test]
async fn corrupt_remote_result_is_reprocessed() {
    let queue = SelectiveQueue {
        files: domain(),
        processor: ChunkProcessor::default(),
        tamper: flip_ciphertext,
    };
    let h = harness(Arc::new(queue), Duration::from_secs(5), 32);
    let data = content(100);

    let stored = h
        .orch
        .store_file(h.bucket_id, h.user_id, "c.bin", data.clone())
        .await
        .unwrap();

    let chunks = h.orch.list_chunks(stored.file_id).unwrap();
    assert_eq!(chunks[1].source, ChunkSource::LocalFallback);
    assert_eq!(chunks[3].source, ChunkSource::LocalFallback);
    assert_eq!(chunks[0].source, ChunkSource::Remote);
    assert_eq!(h.orch.retrieve_file(stored.file_id, h.user_id).await.unwrap(), data);
}

#[tokio::test]
async fn local_worker_pool_handles_every_chunk() {
    let pool = LocalWorkerPool::new(domain(), Arc::new(ChunkProcessor::default()), 3);
    let h = harness(Arc::new(pool), Duration::from_secs(10), 128);
    let data = content(128 * 10);

    let stored = h
        .orch
        .store_file(h.bucket_id, h.user_id, "pool.bin", data.clone())
        .await
        .unwrap();

    let chunks = h.orch.list_chunks(stored.file_id).unwrap();
    assert_eq!(chunks.len(), 10);
    assert!(chunks.iter().all(|c| c.source == ChunkSource::Remote));
    let upload = h.orch.metadata().latest_upload(stored.file_id).unwrap().unwrap();
    assert!(upload.offload_used);
    assert_eq!(upload.remote_chunks, 10);
    assert_eq!(h.orch.retrieve_file(stored.file_id, h.user_id).await.unwrap(), data);
}

#[tokio::test]
async fn worker_with_foreign_root_falls_back() {
    let foreign = Arc::new(FileKeyDomain::from_root(&RootSecret::from_bytes([9u8; 32])).unwrap());
    let pool = LocalWorkerPool::new(foreign, Arc::new(ChunkProcessor::default()), 2);
    let h = harness(Arc::new(pool), Duration::from_secs(10), 50);
    let data = content(120);

    let stored = h
        .orch
        .store_file(h.bucket_id, h.user_id, "k.bin", data.clone())
        .await
        .unwrap();
    let chunks = h.orch.list_chunks(stored.file_id).unwrap();
    assert!(chunks.iter().all(|c| c.source == ChunkSource::LocalFallback));
    assert_eq!(h.orch.retrieve_file(stored.file_id, h.user_id).await.unwrap(), data);
}

#[tokio::test]
async fn one_stalled_chunk_does_not_hold_up_the_rest() {
    let timeout = Duration::from_millis(400);
    let delay = Duration::from_millis(240);
    let queue = StallingQueue {
        files: domain(),
        processor: Arc::new(ChunkProcessor::default()),
        stall_index: 3,
        delay,
        parked: Mutex::new(Vec::new()),
    };
    let h = harness(Arc::new(queue), timeout, 50);
    let data = content(300);

    let started = Instant::now();
    let stored = h
        .orch
        .store_file(h.bucket_id, h.user_id, "stall.bin", data.clone())
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(stored.chunk_count, 6);

    // The stalled chunk costs one timeout; the delayed ones overlap with it.
    assert!(elapsed >= timeout, "finished before the timeout: {elapsed:?}");
    assert!(
        elapsed < timeout + delay / 2,
        "prompt chunks waited behind the stalled one: {elapsed:?}"
    );

    let chunks = h.orch.list_chunks(stored.file_id).unwrap();
    for chunk in &chunks {
        let expected = if chunk.index == 3 {
            ChunkSource::LocalFallback
        } else {
            ChunkSource::Remote
        };
        assert_eq!(chunk.source, expected, "chunk {}", chunk.index);
    }
    let upload = h.orch.metadata().latest_upload(stored.file_id).unwrap().unwrap();
    assert_eq!((upload.remote_chunks, upload.fallback_chunks), (5, 1));
    assert_eq!(h.orch.retrieve_file(stored.file_id, h.user_id).await.unwrap(), data);
}
