//! Engine configuration management

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error_handling::{RetryPolicy, MAX_RETRY_ATTEMPTS};
use super::post_process::{CloudCredentials, CloudProvider, EncryptionMethod};
use crate::utils::file_utils::expand_home;

/// Hard upper bound on chunk workers per download
pub const MAX_THREADS_LIMIT: usize = 16;

/// Main engine configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Final files land here; `~` is expanded
    pub download_directory: String,
    /// Chunk files live in `<download_directory>/<temp_dir_name>/<download id>/`
    pub temp_dir_name: String,
    pub max_threads_per_download: usize,
    /// Resources at or below this size use a single stream
    pub min_chunk_size: u64,
    pub buffer_size: usize,
    pub progress_interval_ms: u64,
    /// Whole-request timeout, 0 disables it
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub user_agent: String,
    pub headers: HashMap<String, String>,
    pub retry: RetryPolicy,
    pub post_process: PostProcessConfig,
}

/// Post-download steps, each one optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostProcessConfig {
    pub encryption: Option<EncryptionSettings>,
    pub cloud_sync: Option<CloudSyncSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionSettings {
    #[serde(default)]
    pub method: EncryptionMethod,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSyncSettings {
    pub provider: CloudProvider,
    pub credentials: CloudCredentials,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_directory: "~/Downloads".to_string(),
            temp_dir_name: ".temp".to_string(),
            max_threads_per_download: 4,
            min_chunk_size: 1024 * 1024,
            buffer_size: 64 * 1024,
            progress_interval_ms: 1000,
            timeout_seconds: 0,
            connect_timeout_seconds: 30,
            user_agent: format!("segment-dl/{}", env!("CARGO_PKG_VERSION")),
            headers: HashMap::new(),
            retry: RetryPolicy::default(),
            post_process: PostProcessConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default location, or defaults
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: EngineConfig =
            serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

        config.validate()?;
        tracing::info!("Loaded configuration from: {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Saved configuration to: {:?}", path);
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "segmentdl", "engine")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.config_dir().join("config.json"))
    }

    /// Download directory with `~` expanded
    pub fn download_dir(&self) -> PathBuf {
        expand_home(&self.download_directory)
    }

    pub fn temp_dir_for(&self, download_id: &str) -> PathBuf {
        self.download_dir()
            .join(&self.temp_dir_name)
            .join(download_id)
    }

    pub fn destination_for(&self, name: &str) -> PathBuf {
        self.download_dir().join(name)
    }

    /// Per-download worker count, clamped to 1..=MAX_THREADS_LIMIT
    pub fn effective_threads(&self) -> usize {
        self.max_threads_per_download.clamp(1, MAX_THREADS_LIMIT)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.download_directory.trim().is_empty() {
            anyhow::bail!("Download directory must not be empty");
        }

        if self.temp_dir_name.trim().is_empty()
            || self.temp_dir_name.contains(['/', '\\'])
            || self.temp_dir_name == ".."
        {
            anyhow::bail!("Temp directory name must be a single path component");
        }

        if self.max_threads_per_download == 0 || self.max_threads_per_download > MAX_THREADS_LIMIT
        {
            anyhow::bail!(
                "Threads per download should be between 1 and {}",
                MAX_THREADS_LIMIT
            );
        }

        if !(1024..=16 * 1024 * 1024).contains(&self.buffer_size) {
            anyhow::bail!("Buffer size should be between 1KB and 16MB");
        }

        if self.progress_interval_ms > 60_000 {
            anyhow::bail!("Progress interval should not exceed 60 seconds");
        }

        if self.connect_timeout_seconds == 0 || self.connect_timeout_seconds > 300 {
            anyhow::bail!("Connect timeout should be between 1 and 300 seconds");
        }

        if self.retry.max_attempts > MAX_RETRY_ATTEMPTS {
            anyhow::bail!("Retry attempts should not exceed {}", MAX_RETRY_ATTEMPTS);
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            anyhow::bail!("Retry jitter factor must be between 0.0 and 1.0");
        }

        if let Some(ref encryption) = self.post_process.encryption {
            if encryption.key.is_empty() {
                anyhow::bail!("Encryption key must not be empty");
            }
        }

        if let Some(ref cloud) = self.post_process.cloud_sync {
            if cloud.credentials.access_token.is_empty() {
                anyhow::bail!("Cloud sync requires an access token");
            }
        }

        Ok(())
    }
}
