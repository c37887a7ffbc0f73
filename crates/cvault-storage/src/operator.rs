//! OpenDAL Operator factory for cvault storage backends

use anyhow::{Context, Result};
use opendal::Operator;

use cvault_core::config::StorageConfig;

/// Build a local-filesystem Operator rooted at `storage.root`.
///
/// Wrapped in logging and retry layers; retries only apply to errors OpenDAL
/// marks temporary, so a permanent write failure still surfaces promptly.
pub fn build_operator(storage: &StorageConfig) -> Result<Operator> {
    let root = storage.root.to_string_lossy();
    // opendal 0.55: builders use the consuming pattern
    let builder = opendal::services::Fs::default().root(&root);

    let op = Operator::new(builder)
        .with_context(|| format!("creating OpenDAL fs operator at {root}"))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(3)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// In-memory Operator for tests and dry runs.
pub fn memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish())
}
