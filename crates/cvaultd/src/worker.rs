//! NATS JetStream chunk worker.
//!
//! Enabled via the `nats` feature (on by default). Runs cvaultd as a
//! horizontally-scalable worker over the CHUNK_JOBS work queue.
//!
//! Architecture:
//!   - One durable pull consumer ("chunk-workers") shared by every replica
//!   - Bounded Tokio task pool; the CPU-bound chunk work runs on blocking threads
//!   - Each job: unwrap file key → transform → encrypt → publish report → ack
//!   - A job whose report cannot be published is nak'd for redelivery
//!   - Prometheus metrics on :9100/metrics
//!   - Graceful shutdown on SIGTERM (drain in-flight jobs, then exit 0)

#[cfg(feature = "nats")]
pub use inner::run;

#[cfg(feature = "nats")]
mod inner {
    use anyhow::{Context, Result};
    use futures::StreamExt;
    use prometheus_client::{
        metrics::{counter::Counter, family::Family, histogram::Histogram},
        registry::Registry,
    };
    use std::sync::Arc;
    use tokio::{
        signal::unix::{signal, SignalKind},
        sync::Semaphore,
    };
    use tracing::{debug, error, info, warn};

    use cvault_core::config::CvaultConfig;
    use cvault_core::types::TransformKind;
    use cvault_crypto::{ChunkProcessor, FileKeyDomain, RootSecret};
    use cvault_pipeline::nats::{JobMessage, NatsClient};
    use cvault_pipeline::{execute_job, JobReport};

    use crate::metrics::{self, HealthState};

    // ── Metrics ───────────────────────────────────────────────────────────────

    #[derive(Clone)]
    pub(crate) struct WorkerMetrics {
        jobs_finished: Family<Vec<(String, String)>, Counter>,
        jobs_failed: Family<Vec<(String, String)>, Counter>,
        job_duration: Family<Vec<(String, String)>, Histogram>,
    }

    impl WorkerMetrics {
        pub(crate) fn new(registry: &mut Registry) -> Self {
            let jobs_finished = Family::default();
            let jobs_failed = Family::default();
            let job_duration =
                Family::<Vec<(String, String)>, Histogram>::new_with_constructor(|| {
                    Histogram::new([0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0])
                });

            registry.register(
                "cvault_worker_jobs_finished",
                "Chunk jobs reported finished",
                jobs_finished.clone(),
            );
            registry.register(
                "cvault_worker_jobs_failed",
                "Chunk jobs reported failed",
                jobs_failed.clone(),
            );
            registry.register(
                "cvault_worker_job_duration_seconds",
                "Chunk job processing duration in seconds",
                job_duration.clone(),
            );

            WorkerMetrics {
                jobs_finished,
                jobs_failed,
                job_duration,
            }
        }

        fn job_labels(transform: TransformKind) -> Vec<(String, String)> {
            vec![("transform".to_string(), transform.as_str().to_string())]
        }

        pub(crate) fn record(&self, transform: TransformKind, report: &JobReport, secs: f64) {
            let labels = Self::job_labels(transform);
            match report {
                JobReport::Finished { .. } => self.jobs_finished.get_or_create(&labels).inc(),
                JobReport::Failed { .. } => self.jobs_failed.get_or_create(&labels).inc(),
            };
            self.job_duration.get_or_create(&labels).observe(secs);
        }
    }

    /// Everything a job needs, shared across tasks.
    struct WorkerContext {
        nats: NatsClient,
        files: FileKeyDomain,
        processor: ChunkProcessor,
        metrics: WorkerMetrics,
    }

    // ── run() ─────────────────────────────────────────────────────────────────

    pub async fn run(config: CvaultConfig) -> Result<()> {
        info!("cvaultd starting in worker mode (NATS consumer)");

        let files = {
            let root = RootSecret::from_config(&config.keys)?;
            FileKeyDomain::from_root(&root)?
        };
        let processor = ChunkProcessor::new(config.offload.accelerator_device.clone());
        if !processor.transforms().accelerator_available() {
            warn!(
                device = %config.offload.accelerator_device.display(),
                "accelerator not present: accelerated jobs will be reported failed"
            );
        }

        let nats = NatsClient::connect(&config.offload.nats_url).await?;
        nats.ensure_streams().await?;

        // Prometheus registry
        let mut registry = Registry::default();
        let worker_metrics = WorkerMetrics::new(&mut registry);
        if let Some(addr) = config.daemon.metrics_addr.clone() {
            let probe = nats.clone();
            let state = HealthState {
                registry: Arc::new(registry),
                ready: Arc::new(move || probe.is_connected()),
            };
            tokio::spawn(async move {
                if let Err(e) = metrics::serve(addr, state).await {
                    warn!("metrics server stopped: {e}");
                }
            });
        }

        let concurrency = match config.offload.concurrency {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            n => n,
        };
        info!(concurrency, "worker pool ready");
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let ctx = Arc::new(WorkerContext {
            nats,
            files,
            processor,
            metrics: worker_metrics,
        });

        // Shutdown signal
        let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

        let consumer_ctx = ctx.clone();
        let sem_clone = semaphore.clone();
        let consumer = tokio::spawn(async move {
            let job_stream = match consumer_ctx.nats.job_stream().await {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to open NATS job stream: {e}");
                    return;
                }
            };
            tokio::pin!(job_stream);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        info!("worker: shutdown signal received, draining...");
                        break;
                    }
                    next = job_stream.next() => {
                        let msg = match next {
                            Some(Ok(m)) => m,
                            Some(Err(e)) => {
                                warn!("error reading NATS message: {e}");
                                continue;
                            }
                            None => {
                                warn!("NATS job stream ended");
                                break;
                            }
                        };

                        let Ok(permit) = sem_clone.clone().acquire_owned().await else {
                            break;
                        };
                        let ctx = consumer_ctx.clone();
                        tokio::spawn(async move {
                            let _permit = permit; // released when the job completes
                            handle_job(msg, ctx).await;
                        });
                    }
                }
            }

            // Drain: wait for all in-flight jobs
            let _ = sem_clone.acquire_many(concurrency as u32).await;
            info!("worker: all in-flight jobs complete");
        });

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = shutdown_tx.send(());
        let _ = consumer.await;

        info!("worker exiting cleanly");
        Ok(())
    }

    // ── Job execution ─────────────────────────────────────────────────────────

    async fn handle_job(msg: JobMessage, ctx: Arc<WorkerContext>) {
        let job_id = msg.job.job_id.clone();
        let transform = msg.job.transform;
        let start = std::time::Instant::now();

        let job = msg.job.clone();
        let task_ctx = ctx.clone();
        let report = match tokio::task::spawn_blocking(move || {
            execute_job(&job, &task_ctx.files, &task_ctx.processor)
        })
        .await
        {
            Ok(report) => report,
            Err(e) => JobReport::Failed {
                job_id: job_id.clone(),
                reason: format!("worker task panicked: {e}"),
            },
        };
        let elapsed = start.elapsed().as_secs_f64();
        ctx.metrics.record(transform, &report, elapsed);

        match &report {
            JobReport::Finished { .. } => debug!(
                job_id = %job_id,
                file_id = msg.job.file_id,
                index = msg.job.index,
                elapsed_secs = elapsed,
                "job finished"
            ),
            JobReport::Failed { reason, .. } => warn!(
                job_id = %job_id,
                file_id = msg.job.file_id,
                index = msg.job.index,
                reason = %reason,
                "job failed"
            ),
        }

        // A failed report is still terminal for the job; only a lost report
        // warrants redelivery.
        match ctx.nats.publish_report(&report).await {
            Ok(()) => {
                if let Err(e) = msg.ack().await {
                    warn!(job_id = %job_id, "ack failed: {e}");
                }
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "report publish failed");
                if let Err(nak_err) = msg.nak().await {
                    warn!(job_id = %job_id, "nak failed: {nak_err}");
                }
            }
        }
    }

}
