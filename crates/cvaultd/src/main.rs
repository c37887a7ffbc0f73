//! cvaultd: cvault chunk worker daemon
//!
//! Usage:
//!   cvaultd [--config /etc/cvault/config.toml]
//!
//! Pulls chunk jobs from the CHUNK_JOBS stream, runs each through the chunk
//! processor and publishes a `finished`/`failed` report for the submitter.
//! Horizontally scalable: every replica binds the same durable consumer.

mod metrics;
mod worker;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use cvault_core::config::CvaultConfig;

#[derive(Parser, Debug)]
#[command(name = "cvaultd", version, about = "cvault chunk worker daemon")]
struct Cli {
    /// Path to cvault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "CVAULT_CONFIG",
        default_value = "/etc/cvault/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [daemon] log_level
    #[arg(long, env = "CVAULT_LOG")]
    log: Option<String>,

    /// Log format; overrides [daemon] log_format
    #[arg(long, env = "CVAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Worker concurrency (0 = cpu count); overrides [offload] concurrency
    #[arg(long, env = "CVAULT_WORKER_CONCURRENCY")]
    concurrency: Option<usize>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CvaultConfig::load(&cli.config)?;
    if let Some(n) = cli.concurrency {
        config.offload.concurrency = n;
    }

    let level = cli.log.as_deref().unwrap_or(&config.daemon.log_level);
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.daemon.log_format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    });
    init_logging(level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        config_found = cli.config.exists(),
        nats = %config.offload.nats_url,
        "cvaultd starting"
    );

    #[cfg(feature = "nats")]
    return worker::run(config).await;
    #[cfg(not(feature = "nats"))]
    anyhow::bail!("cvaultd was built without the nats feature: cargo build --features nats")
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
