use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CvaultError, CvaultResult};
use crate::types::TransformKind;

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Default per-job offload timeout in seconds
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 60;

/// Top-level configuration (loaded from cvault.toml, then env overrides)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CvaultConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub keys: KeysConfig,
    pub offload: OffloadConfig,
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Prometheus metrics endpoint for the worker daemon
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Object store root directory
    pub root: PathBuf,
    /// Fixed chunk size in bytes
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Encrypted key-table file of the local key vault
    pub vault_path: PathBuf,
    /// Base64 root secret (prefer CVAULT_ROOT_SECRET over the file)
    #[serde(skip_serializing)]
    pub root_secret: Option<SecretString>,
}

/// Which transform the chunk processor runs before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformMode {
    Accelerated,
    #[default]
    Identity,
}

impl std::str::FromStr for TransformMode {
    type Err = CvaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accelerated" | "gpu" => Ok(TransformMode::Accelerated),
            "identity" | "cpu" => Ok(TransformMode::Identity),
            other => Err(CvaultError::Config(format!(
                "unknown transform mode '{other}' (expected accelerated|identity)"
            ))),
        }
    }
}

impl From<TransformMode> for TransformKind {
    fn from(mode: TransformMode) -> Self {
        match mode {
            TransformMode::Accelerated => TransformKind::Accelerated,
            TransformMode::Identity => TransformKind::Identity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Submit chunk jobs to the NATS worker pool
    pub enabled: bool,
    /// NATS endpoint of the worker pool
    pub nats_url: String,
    /// Independent wait budget per chunk job
    pub job_timeout_secs: u64,
    pub transform: TransformMode,
    /// Device node whose presence marks the accelerator as available
    pub accelerator_device: PathBuf,
    /// In-process worker tasks used when NATS offload is disabled (0 = none)
    pub local_workers: usize,
    /// Worker daemon concurrency (0 = cpu_count)
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// JSON metadata database path
    pub path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/data/storage"),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            vault_path: PathBuf::from("/var/lib/cvault/hsm_keys.bin"),
            root_secret: None,
        }
    }
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nats_url: "nats://localhost:4222".into(),
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            transform: TransformMode::Identity,
            accelerator_device: PathBuf::from("/dev/nvidia0"),
            local_workers: 0,
            concurrency: 0,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/cvault/metadata.json"),
        }
    }
}

impl CvaultConfig {
    /// Load from `path` (defaults when missing), apply process env, validate.
    pub fn load(path: &Path) -> CvaultResult<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| CvaultError::Config(format!("parsing {}: {e}", path.display())))?
        } else {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            CvaultConfig::default()
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CVAULT_*` overrides from an environment snapshot.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> CvaultResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "CVAULT_CHUNK_SIZE" => self.storage.chunk_size = parse_num(&key, &value)?,
                "CVAULT_STORAGE_ROOT" => self.storage.root = PathBuf::from(value),
                "CVAULT_JOB_TIMEOUT_SECS" => {
                    self.offload.job_timeout_secs = parse_num(&key, &value)?
                }
                "CVAULT_ROOT_SECRET" => self.keys.root_secret = Some(SecretString::from(value)),
                "CVAULT_TRANSFORM_MODE" => self.offload.transform = value.parse()?,
                "CVAULT_NATS_URL" => self.offload.nats_url = value,
                "CVAULT_OFFLOAD_ENABLED" => {
                    self.offload.enabled = matches!(value.as_str(), "1" | "true" | "yes")
                }
                "CVAULT_VAULT_PATH" => self.keys.vault_path = PathBuf::from(value),
                "CVAULT_METADATA_PATH" => self.metadata.path = PathBuf::from(value),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> CvaultResult<()> {
        if self.storage.chunk_size == 0 {
            return Err(CvaultError::Config("storage.chunk_size must be > 0".into()));
        }
        if self.offload.job_timeout_secs == 0 {
            return Err(CvaultError::Config(
                "offload.job_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.offload.job_timeout_secs)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> CvaultResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CvaultError::Config(format!("{key}: expected a number, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
log_level = "debug"
log_format = "json"

[storage]
root = "/srv/cvault"
chunk_size = 1048576

[keys]
vault_path = "/srv/cvault/hsm.bin"
root_secret = "c2VjcmV0"

[offload]
enabled = true
nats_url = "nats://workers:4222"
job_timeout_secs = 30
transform = "accelerated"
local_workers = 2

[metadata]
path = "/srv/cvault/meta.json"
"#;
        let config: CvaultConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.storage.root, PathBuf::from("/srv/cvault"));
        assert_eq!(config.storage.chunk_size, 1024 * 1024);
        assert_eq!(config.keys.vault_path, PathBuf::from("/srv/cvault/hsm.bin"));
        assert_eq!(
            config.keys.root_secret.as_ref().unwrap().expose_secret(),
            "c2VjcmV0"
        );
        assert!(config.offload.enabled);
        assert_eq!(config.offload.job_timeout_secs, 30);
        assert_eq!(config.offload.transform, TransformMode::Accelerated);
        assert_eq!(config.offload.local_workers, 2);
        assert_eq!(config.metadata.path, PathBuf::from("/srv/cvault/meta.json"));
    }

    #[test]
    fn test_parse_defaults() {
        let config: CvaultConfig = toml::from_str("").unwrap();

        assert_eq!(config.storage.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.storage.root, PathBuf::from("/data/storage"));
        assert_eq!(config.offload.job_timeout_secs, 60);
        assert_eq!(config.offload.transform, TransformMode::Identity);
        assert!(!config.offload.enabled);
        assert!(config.keys.root_secret.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CvaultConfig::default();
        config
            .apply_env_overrides(env(&[
                ("CVAULT_CHUNK_SIZE", "4096"),
                ("CVAULT_STORAGE_ROOT", "/tmp/objects"),
                ("CVAULT_JOB_TIMEOUT_SECS", "5"),
                ("CVAULT_TRANSFORM_MODE", "gpu"),
                ("CVAULT_ROOT_SECRET", "AAAA"),
                ("CVAULT_OFFLOAD_ENABLED", "true"),
                ("UNRELATED", "ignored"),
            ]))
            .unwrap();

        assert_eq!(config.storage.chunk_size, 4096);
        assert_eq!(config.storage.root, PathBuf::from("/tmp/objects"));
        assert_eq!(config.job_timeout(), std::time::Duration::from_secs(5));
        assert_eq!(config.offload.transform, TransformMode::Accelerated);
        assert!(config.offload.enabled);
        assert!(config.keys.root_secret.is_some());
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = CvaultConfig::default();
        let err = config
            .apply_env_overrides(env(&[("CVAULT_CHUNK_SIZE", "five")]))
            .unwrap_err();
        assert!(err.to_string().contains("CVAULT_CHUNK_SIZE"));

        let err = config
            .apply_env_overrides(env(&[("CVAULT_TRANSFORM_MODE", "quantum")]))
            .unwrap_err();
        assert!(matches!(err, CvaultError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = CvaultConfig::default();
        config.storage.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_root_secret_never_serialized() {
        let mut config = CvaultConfig::default();
        config.keys.root_secret = Some(SecretString::from("top-secret"));
        let toml_str = toml::to_string(&config).unwrap();
        assert!(!toml_str.contains("top-secret"));

        let cloned = config.clone();
        assert_eq!(
            cloned.keys.root_secret.unwrap().expose_secret(),
            "top-secret"
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = CvaultConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert!(config.storage.chunk_size > 0);
    }
}
