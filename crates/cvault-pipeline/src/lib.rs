//! cvault-pipeline: job queues, offload dispatcher, metadata store and upload orchestrator

pub mod dispatch;
pub mod metadata;
pub mod nats;
pub mod queue;
pub mod upload;

pub use dispatch::{DispatchRequest, DispatchedChunk, OffloadDispatcher};
pub use metadata::{MetadataStore, NewAudit, NewFile, UploadSummary};
pub use queue::{
    execute_job, ChunkJob, JobHandle, JobQueue, JobReport, LocalWorkerPool, RemoteChunkResult,
};
pub use upload::{UploadOrchestrator, UploadPhase, UploadSettings};

// Re-export key NATS types for convenience
#[cfg(feature = "nats")]
pub use nats::{NatsClient, NatsJobQueue};
