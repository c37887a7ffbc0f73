//! NATS JetStream transport for chunk jobs.
//!
//! Provides:
//! - `NatsClient`: connect, ensure the job stream exists, publish jobs and reports
//! - `job_stream()`: pull consumer for `cvaultd` workers
//! - `NatsJobQueue`: the orchestrator-side [`JobQueue`] over NATS
//!
//! Jobs go through the `CHUNK_JOBS` work-queue stream so each is delivered to
//! one worker, redelivered on nak or ack timeout. Reports are plain core-NATS
//! messages on `CHUNK_RESULTS.<job_id>`; the submitter subscribes before it
//! publishes the job, so a fast worker cannot beat the subscription.
//!
//! Payloads are base64 JSON, so the server's `max_payload` must exceed
//! roughly 4/3 of the configured chunk size.
//!
//! Requires feature `nats` (async-nats optional dep).

#[cfg(feature = "nats")]
pub use inner::*;

#[cfg(feature = "nats")]
mod inner {
    use std::time::Duration;

    use anyhow::Result;
    use async_nats::jetstream::{self, consumer::pull, stream};
    use futures::future::BoxFuture;
    use futures::StreamExt;
    use tokio::sync::oneshot;
    use tracing::{debug, info, warn};

    use cvault_core::{CvaultError, CvaultResult};

    use crate::queue::{ChunkJob, JobHandle, JobQueue, JobReport};

    // ── Stream / consumer names ───────────────────────────────────────────────

    pub const STREAM_CHUNK_JOBS: &str = "CHUNK_JOBS";
    pub const CONSUMER_CHUNK_WORKERS: &str = "chunk-workers";
    pub const RESULTS_SUBJECT_PREFIX: &str = "CHUNK_RESULTS";

    /// Core subject a job's report is published on.
    pub fn result_subject(job_id: &str) -> String {
        format!("{RESULTS_SUBJECT_PREFIX}.{job_id}")
    }

    // ── NatsClient ────────────────────────────────────────────────────────────

    /// NATS JetStream client wrapper for cvault job distribution.
    #[derive(Clone)]
    pub struct NatsClient {
        client: async_nats::Client,
        js: jetstream::Context,
    }

    impl NatsClient {
        /// Connect to NATS and return a JetStream-enabled client.
        pub async fn connect(url: &str) -> Result<Self> {
            let client = async_nats::connect(url)
                .await
                .map_err(|e| anyhow::anyhow!("connecting to NATS at {url}: {e}"))?;
            info!("NATS: connected to {url}");
            let js = jetstream::new(client.clone());
            Ok(NatsClient { client, js })
        }

        pub fn is_connected(&self) -> bool {
            matches!(
                self.client.connection_state(),
                async_nats::connection::State::Connected
            )
        }

        /// Ensure the CHUNK_JOBS stream exists (idempotent).
        pub async fn ensure_streams(&self) -> Result<()> {
            self.js
                .get_or_create_stream(stream::Config {
                    name: STREAM_CHUNK_JOBS.to_string(),
                    subjects: vec![STREAM_CHUNK_JOBS.to_string()],
                    max_messages: 100_000,
                    max_age: Duration::from_secs(3600),
                    retention: stream::RetentionPolicy::WorkQueue,
                    ..Default::default()
                })
                .await
                .map_err(|e| anyhow::anyhow!("ensuring CHUNK_JOBS stream: {e}"))?;

            info!("NATS: stream verified (CHUNK_JOBS)");
            Ok(())
        }

        /// Publish a job to the CHUNK_JOBS stream and wait for the stream ack.
        pub async fn publish_job(&self, job: &ChunkJob) -> Result<()> {
            let payload = job.to_bytes()?;
            self.js
                .publish(STREAM_CHUNK_JOBS, payload)
                .await
                .map_err(|e| anyhow::anyhow!("publishing to CHUNK_JOBS: {e}"))?
                .await
                .map_err(|e| anyhow::anyhow!("awaiting NATS publish ack: {e}"))?;
            debug!(
                job_id = %job.job_id,
                file_id = job.file_id,
                index = job.index,
                "chunk job queued"
            );
            Ok(())
        }

        /// Publish a worker's report on the job's result subject.
        pub async fn publish_report(&self, report: &JobReport) -> Result<()> {
            let subject = result_subject(report.job_id());
            let payload = report.to_bytes()?;
            self.client
                .publish(subject, payload)
                .await
                .map_err(|e| anyhow::anyhow!("publishing job report: {e}"))?;
            self.client
                .flush()
                .await
                .map_err(|e| anyhow::anyhow!("flushing job report: {e}"))?;
            debug!(job_id = report.job_id(), status = report.status(), "job report published");
            Ok(())
        }

        /// Subscribe to the report subject of one job.
        pub async fn subscribe_report(&self, job_id: &str) -> Result<async_nats::Subscriber> {
            self.client
                .subscribe(result_subject(job_id))
                .await
                .map_err(|e| anyhow::anyhow!("subscribing to job report: {e}"))
        }

        /// Create (or bind to) the durable pull consumer and stream jobs.
        ///
        /// ack_wait 60s, max_deliver 3: a job is retried on two more workers
        /// before JetStream gives up on it.
        pub async fn job_stream(
            &self,
        ) -> Result<impl futures::Stream<Item = Result<JobMessage>>> {
            let consumer: jetstream::consumer::Consumer<pull::Config> = self
                .js
                .create_consumer_on_stream(
                    pull::Config {
                        durable_name: Some(CONSUMER_CHUNK_WORKERS.to_string()),
                        ack_wait: Duration::from_secs(60),
                        max_deliver: 3,
                        ..Default::default()
                    },
                    STREAM_CHUNK_JOBS,
                )
                .await
                .map_err(|e| anyhow::anyhow!("creating chunk-workers consumer: {e}"))?;

            let messages = consumer
                .messages()
                .await
                .map_err(|e| anyhow::anyhow!("opening pull consumer message stream: {e}"))?;

            let stream = messages.map(|msg_result| {
                let msg = msg_result.map_err(|e| anyhow::anyhow!("receiving NATS message: {e}"))?;
                let job = ChunkJob::from_bytes(&msg.payload)?;
                Ok(JobMessage { job, msg })
            });

            Ok(stream)
        }
    }

    // ── JobMessage ────────────────────────────────────────────────────────────

    /// A received job with its JetStream message handle for ack/nak.
    pub struct JobMessage {
        pub job: ChunkJob,
        msg: jetstream::Message,
    }

    impl JobMessage {
        /// Acknowledge successful handling (removes it from the work queue).
        pub async fn ack(self) -> Result<()> {
            self.msg
                .ack()
                .await
                .map_err(|e| anyhow::anyhow!("acking NATS message: {e}"))
        }

        /// Negative-acknowledge (triggers redelivery up to max_deliver).
        pub async fn nak(self) -> Result<()> {
            self.msg
                .ack_with(jetstream::AckKind::Nak(None))
                .await
                .map_err(|e| anyhow::anyhow!("naking NATS message: {e}"))
        }
    }

    // ── NatsJobQueue ──────────────────────────────────────────────────────────

    /// [`JobQueue`] backed by the CHUNK_JOBS stream.
    pub struct NatsJobQueue {
        client: NatsClient,
    }

    impl NatsJobQueue {
        pub async fn connect(url: &str) -> Result<Self> {
            let client = NatsClient::connect(url).await?;
            client.ensure_streams().await?;
            Ok(Self { client })
        }

        pub fn new(client: NatsClient) -> Self {
            Self { client }
        }
    }

    impl JobQueue for NatsJobQueue {
        fn name(&self) -> &'static str {
            "nats"
        }

        fn submit(&self, job: ChunkJob) -> BoxFuture<'_, CvaultResult<JobHandle>> {
            Box::pin(async move {
                let mut reports = self
                    .client
                    .subscribe_report(&job.job_id)
                    .await
                    .map_err(CvaultError::Other)?;
                self.client
                    .publish_job(&job)
                    .await
                    .map_err(CvaultError::Other)?;

                let (mut tx, rx) = oneshot::channel();
                let job_id = job.job_id.clone();
                tokio::spawn(async move {
                    let received = tokio::select! {
                        // Dispatcher gave up (timeout); stop listening.
                        _ = tx.closed() => None,
                        msg = reports.next() => msg,
                    };
                    if let Some(msg) = received {
                        let report = JobReport::from_bytes(&msg.payload).unwrap_or_else(|e| {
                            warn!(job_id = %job_id, error = %e, "undecodable job report");
                            JobReport::Failed {
                                job_id: job_id.clone(),
                                reason: e.to_string(),
                            }
                        });
                        let _ = tx.send(report);
                    }
                    let _ = reports.unsubscribe().await;
                });

                Ok(JobHandle::new(job.job_id, rx))
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn result_subject_is_per_job() {
            assert_eq!(result_subject("abc"), "CHUNK_RESULTS.abc");
        }
    }
}
