//! cvault: encrypted chunk vault CLI
//!
//! Admin commands:
//!   keygen                         - print a fresh base64 root secret
//!   status                         - storage, vault and offload status
//!   config show                    - display current configuration
//!   user add | user verify-key <id>
//!   bucket add --owner <id> <name>
//!
//! Data commands:
//!   put --user <id> --bucket <id> <local> [--name <n>]
//!   get --user <id> <file_id> [-o <out>]
//!   stat <file_id> | chunks <file_id> | audit [--user <id>]

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use cvault_core::config::CvaultConfig;
use cvault_core::types::{unix_now, AuditAction, AuditOutcome, TransformKind};
use cvault_crypto::{ChunkProcessor, FileKeyDomain, KeyHierarchy, KeyVault, RootSecret};
use cvault_pipeline::{
    JobQueue, LocalWorkerPool, MetadataStore, OffloadDispatcher, UploadOrchestrator,
    UploadSettings,
};
use cvault_storage::{build_operator, ObjectStore};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cvault",
    version,
    about = "cvault encrypted chunk vault client",
    long_about = "cvault: provision users and buckets, store and retrieve encrypted files"
)]
struct Cli {
    /// Path to cvault.toml configuration file
    #[arg(long, short = 'c', env = "CVAULT_CONFIG", default_value = "/etc/cvault/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a new random root secret (base64) for CVAULT_ROOT_SECRET
    Keygen,

    /// Show storage, key vault and offload status
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// User and key hierarchy management
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Bucket management
    Bucket {
        #[command(subcommand)]
        action: BucketAction,
    },

    /// Chunk, encrypt and store a local file
    Put {
        /// Local file to upload
        local: PathBuf,
        /// Owning user id
        #[arg(long, short = 'u')]
        user: u64,
        /// Destination bucket id
        #[arg(long, short = 'b')]
        bucket: u64,
        /// Stored filename (default: local file name)
        #[arg(long, short = 'n')]
        name: Option<String>,
    },

    /// Retrieve and decrypt a stored file
    Get {
        file_id: u64,
        /// Requesting user id (must own the file's bucket)
        #[arg(long, short = 'u')]
        user: u64,
        /// Output path (default: stored filename in the current directory)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Show file metadata and its upload history
    Stat { file_id: u64 },

    /// List a file's chunk records
    Chunks { file_id: u64 },

    /// Show the audit log
    Audit {
        /// Only entries for this user
        #[arg(long, short = 'u')]
        user: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Create a user with a fresh vault key and wrapped master key
    Add,
    /// Unwrap a user's master key to check the hierarchy is intact
    #[command(name = "verify-key")]
    VerifyKey { user_id: u64 },
}

#[derive(Subcommand, Debug)]
enum BucketAction {
    /// Create a bucket owned by a user
    Add {
        name: String,
        #[arg(long)]
        owner: u64,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = CvaultConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    match cli.command {
        Commands::Keygen => cmd_keygen(),
        Commands::Status => cmd_status(&config).await,
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
        Commands::User { action: UserAction::Add } => cmd_user_add(&config),
        Commands::User { action: UserAction::VerifyKey { user_id } } => {
            cmd_user_verify_key(&config, user_id)
        }
        Commands::Bucket { action: BucketAction::Add { name, owner } } => {
            cmd_bucket_add(&config, owner, &name)
        }
        Commands::Put { local, user, bucket, name } => {
            cmd_put(&config, &local, user, bucket, name.as_deref()).await
        }
        Commands::Get { file_id, user, output } => {
            cmd_get(&config, file_id, user, output.as_deref()).await
        }
        Commands::Stat { file_id } => cmd_stat(&config, file_id),
        Commands::Chunks { file_id } => cmd_chunks(&config, file_id),
        Commands::Audit { user } => cmd_audit(&config, user),
    }
}

/// Warnings and errors to stderr; RUST_LOG for more.
fn init_logging() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Service wiring ────────────────────────────────────────────────────────────

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    Ok(())
}

fn open_metadata(config: &CvaultConfig) -> Result<MetadataStore> {
    MetadataStore::open(&config.metadata.path)
        .with_context(|| format!("opening metadata: {}", config.metadata.path.display()))
}

fn open_keys(config: &CvaultConfig, root: &RootSecret) -> Result<KeyHierarchy> {
    ensure_parent(&config.keys.vault_path)?;
    let vault = KeyVault::open(&config.keys.vault_path, root)
        .with_context(|| format!("opening key vault: {}", config.keys.vault_path.display()))?;
    Ok(KeyHierarchy::new(Arc::new(vault), root)?)
}

/// Job queue per config: NATS when offload is enabled, else the in-process
/// pool when `local_workers > 0`, else none. An unreachable NATS server
/// degrades to local processing.
async fn build_queue(
    config: &CvaultConfig,
    root: &RootSecret,
    processor: &Arc<ChunkProcessor>,
) -> Result<Option<Arc<dyn JobQueue>>> {
    if config.offload.enabled {
        #[cfg(feature = "nats")]
        {
            match cvault_pipeline::NatsJobQueue::connect(&config.offload.nats_url).await {
                Ok(queue) => return Ok(Some(Arc::new(queue))),
                Err(e) => warn!(
                    nats = %config.offload.nats_url,
                    "offload unavailable, processing locally: {e}"
                ),
            }
        }
        #[cfg(not(feature = "nats"))]
        warn!("offload enabled but cvault was built without the nats feature");
    }
    if config.offload.local_workers > 0 {
        let files = Arc::new(FileKeyDomain::from_root(root)?);
        return Ok(Some(Arc::new(LocalWorkerPool::new(
            files,
            Arc::clone(processor),
            config.offload.local_workers,
        ))));
    }
    Ok(None)
}

async fn build_orchestrator(config: &CvaultConfig) -> Result<UploadOrchestrator> {
    let root = RootSecret::from_config(&config.keys)?;
    let keys = open_keys(config, &root)?;
    let metadata = open_metadata(config)?;
    let op = build_operator(&config.storage).context("building storage operator")?;

    let processor = Arc::new(ChunkProcessor::new(config.offload.accelerator_device.clone()));
    let queue = build_queue(config, &root, &processor).await?;
    let dispatcher = OffloadDispatcher::new(queue, processor, config.job_timeout());

    Ok(UploadOrchestrator::new(
        Arc::new(metadata),
        Arc::new(keys),
        ObjectStore::new(op),
        dispatcher,
        UploadSettings {
            chunk_size: config.storage.chunk_size,
            transform: config.offload.transform.into(),
        },
    ))
}

// ── Progress helpers ──────────────────────────────────────────────────────────

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

// ── `cvault keygen` ───────────────────────────────────────────────────────────

fn cmd_keygen() -> Result<()> {
    let mut secret = zeroize::Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(&mut secret[..]);
    println!("{}", STANDARD.encode(&secret[..]));
    Ok(())
}

// ── `cvault status` ───────────────────────────────────────────────────────────

async fn cmd_status(config: &CvaultConfig) -> Result<()> {
    println!("cvault v{}", env!("CARGO_PKG_VERSION"));

    match build_operator(&config.storage) {
        Ok(op) => {
            let health = match cvault_storage::check_health(&op).await {
                Ok(()) => "ok".to_string(),
                Err(e) => format!("unreachable ({e})"),
            };
            println!("  storage:     {} [{health}]", config.storage.root.display());
        }
        Err(e) => println!("  storage:     {} [error: {e}]", config.storage.root.display()),
    }
    println!("  chunk size:  {}", fmt_bytes(config.storage.chunk_size as u64));

    match RootSecret::from_config(&config.keys) {
        Ok(root) => match KeyVault::open(&config.keys.vault_path, &root) {
            Ok(vault) => println!(
                "  key vault:   {} ({} keys)",
                config.keys.vault_path.display(),
                vault.len()
            ),
            Err(e) => println!("  key vault:   {} [error: {e}]", config.keys.vault_path.display()),
        },
        Err(e) => println!("  key vault:   [error: {e}]"),
    }

    println!("  metadata:    {}", config.metadata.path.display());
    let offload = if config.offload.enabled {
        format!("nats ({})", config.offload.nats_url)
    } else if config.offload.local_workers > 0 {
        format!("local pool ({} workers)", config.offload.local_workers)
    } else {
        "disabled (in-process)".to_string()
    };
    println!("  offload:     {offload}");
    println!("  job timeout: {}s", config.offload.job_timeout_secs);
    let transform: TransformKind = config.offload.transform.into();
    println!("  transform:   {}", transform.as_str());
    Ok(())
}

// ── `cvault config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &CvaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `cvault user` / `cvault bucket` ───────────────────────────────────────────

fn cmd_user_add(config: &CvaultConfig) -> Result<()> {
    let root = RootSecret::from_config(&config.keys)?;
    let keys = open_keys(config, &root)?;
    let metadata = open_metadata(config)?;

    let user = metadata.create_user_with(|id| keys.provision_user(id))?;
    println!("Created user {}", user.id);
    println!("  vault key:   {}", user.kms_key_id);
    println!("  key version: {}", user.key_version);
    Ok(())
}

fn cmd_user_verify_key(config: &CvaultConfig, user_id: u64) -> Result<()> {
    let root = RootSecret::from_config(&config.keys)?;
    let keys = open_keys(config, &root)?;
    let metadata = open_metadata(config)?;

    let user = metadata.get_user(user_id)?;
    match keys.unwrap_master_key(&user.kms_key_id, &user.wrapped_master_key) {
        Ok(_) => {
            metadata.append_audit(
                user_id,
                None,
                AuditAction::KeyUnwrap,
                AuditOutcome::Success,
                format!("Master key unwrapped via {}", user.kms_key_id),
            )?;
            println!("User {user_id}: master key OK ({})", user.kms_key_id);
            Ok(())
        }
        Err(e) => {
            metadata.append_audit(
                user_id,
                None,
                AuditAction::KeyUnwrap,
                AuditOutcome::Failure,
                format!("Master key unwrap via {} failed: {e}", user.kms_key_id),
            )?;
            Err(e).with_context(|| format!("verifying master key of user {user_id}"))
        }
    }
}

fn cmd_bucket_add(config: &CvaultConfig, owner: u64, name: &str) -> Result<()> {
    let metadata = open_metadata(config)?;
    let bucket = metadata.create_bucket(owner, name)?;
    println!("Created bucket {} '{}' (owner {})", bucket.id, bucket.name, bucket.owner_id);
    Ok(())
}

// ── `cvault put` / `cvault get` ───────────────────────────────────────────────

async fn cmd_put(
    config: &CvaultConfig,
    local: &Path,
    user: u64,
    bucket: u64,
    name: Option<&str>,
) -> Result<()> {
    let filename = match name {
        Some(n) => n.to_string(),
        None => local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("{} has no file name; pass --name", local.display()))?,
    };
    let content = tokio::fs::read(local)
        .await
        .with_context(|| format!("reading {}", local.display()))?;
    let size = content.len() as u64;

    let orch = build_orchestrator(config).await?;

    println!("Storing {} → bucket {bucket} as '{filename}'", local.display());
    let pb = make_spinner("put");
    pb.set_message(format!("{} ({})", filename, fmt_bytes(size)));

    let stored = orch
        .store_file(bucket, user, &filename, Bytes::from(content))
        .await;
    let stored = match stored {
        Ok(s) => {
            pb.finish_with_message("done".to_string());
            s
        }
        Err(e) => {
            pb.abandon_with_message("failed".to_string());
            return Err(e).with_context(|| format!("storing {}", local.display()));
        }
    };

    let upload = orch.metadata().latest_upload(stored.file_id)?;
    println!("  file id: {}", stored.file_id);
    println!("  chunks:  {}", stored.chunk_count);
    println!("  bytes:   {}", fmt_bytes(size));
    if let Some(u) = upload {
        println!(
            "  offload: {} (remote {}, fallback {})",
            if u.offload_used { "used" } else { "not used" },
            u.remote_chunks,
            u.fallback_chunks
        );
    }
    Ok(())
}

async fn cmd_get(
    config: &CvaultConfig,
    file_id: u64,
    user: u64,
    output: Option<&Path>,
) -> Result<()> {
    let orch = build_orchestrator(config).await?;
    let meta = orch.get_file_metadata(file_id)?;
    let out = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&meta.filename));

    let pb = make_spinner("get");
    pb.set_message(format!("{} ({})", meta.filename, fmt_bytes(meta.size_bytes)));
    let content = match orch.retrieve_file(file_id, user).await {
        Ok(c) => {
            pb.finish_with_message("done".to_string());
            c
        }
        Err(e) => {
            pb.abandon_with_message("failed".to_string());
            return Err(e).with_context(|| format!("retrieving file {file_id}"));
        }
    };

    ensure_parent(&out)?;
    tokio::fs::write(&out, &content)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    println!("Retrieved:");
    println!("  local:  {}", out.display());
    println!("  bytes:  {}", fmt_bytes(content.len() as u64));
    Ok(())
}

// ── `cvault stat` / `cvault chunks` / `cvault audit` ──────────────────────────

fn cmd_stat(config: &CvaultConfig, file_id: u64) -> Result<()> {
    let metadata = open_metadata(config)?;
    let file = metadata.get_file(file_id)?;

    println!("File {}: {}", file.id, file.filename);
    println!("  bucket:     {}", file.bucket_id);
    println!("  version:    {}", file.version);
    println!("  size:       {}", fmt_bytes(file.size_bytes));
    println!("  chunks:     {} x {}", file.chunk_count, fmt_bytes(file.chunk_size));
    println!("  created:    {}", fmt_age(file.created_at));
    for upload in metadata.uploads_for(file_id)? {
        println!(
            "  upload {}:   {} offload={} remote={} fallback={}{}",
            upload.id,
            upload.status.as_str(),
            upload.offload_used,
            upload.remote_chunks,
            upload.fallback_chunks,
            upload
                .notes
                .as_deref()
                .map(|n| format!(" ({n})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_chunks(config: &CvaultConfig, file_id: u64) -> Result<()> {
    let metadata = open_metadata(config)?;
    metadata.get_file(file_id)?;
    let chunks = metadata.list_chunks(file_id)?;
    if chunks.is_empty() {
        println!("File {file_id}: no chunk records");
        return Ok(());
    }
    println!("{:>5}  {:>10}  {:<14}  {:<11}  {:<16}  object", "index", "size", "source", "transform", "digest");
    for c in chunks {
        println!(
            "{:>5}  {:>10}  {:<14}  {:<11}  {:<16}  {}",
            c.index,
            fmt_bytes(c.size_bytes),
            c.source.as_str(),
            c.transform.as_str(),
            &c.digest[..16.min(c.digest.len())],
            c.object_key
        );
    }
    Ok(())
}

fn cmd_audit(config: &CvaultConfig, user: Option<u64>) -> Result<()> {
    let metadata = open_metadata(config)?;
    let entries = metadata.audit_log(user)?;
    if entries.is_empty() {
        println!("No audit entries");
        return Ok(());
    }
    for e in entries {
        println!(
            "#{:<5} {:<14} user={:<4} file={:<6} {:<10} {:<7} {}",
            e.id,
            fmt_age(e.created_at),
            e.user_id,
            e.file_id.map(|f| f.to_string()).unwrap_or_else(|| "-".into()),
            e.action.as_str(),
            e.outcome.as_str(),
            e.note
        );
    }
    Ok(())
}

fn fmt_age(ts: u64) -> String {
    let secs = unix_now().saturating_sub(ts);
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
