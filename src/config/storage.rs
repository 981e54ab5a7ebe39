//! Configuration Storage
//!
//! Handles reading/writing the core configuration file.
//! Location: ~/.shellmux on macOS/Linux, %APPDATA%\Shellmux on Windows

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::session::DEFAULT_KEEPALIVE_INTERVAL;
use crate::sftp::transfer::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENT_TRANSFERS, DEFAULT_PROGRESS_INTERVAL,
};
use crate::ssh::client::DEFAULT_CONNECT_TIMEOUT;
use crate::ssh::host_key_prompt::DEFAULT_PROMPT_TIMEOUT;
use crate::ssh::HostKeyPolicy;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

impl serde::Serialize for StorageError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Get the data directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("Shellmux"));
        }
        dirs::home_dir()
            .map(|home| home.join(".shellmux"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".shellmux"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Tunables for the core. Every field has a default, so a partial or
/// missing file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub version: u32,
    /// Trust store location; `<data dir>/known_hosts` when unset
    pub known_hosts_path: Option<PathBuf>,
    /// Used for profiles without their own policy
    pub default_host_key_policy: HostKeyPolicy,
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub prompt_timeout_secs: u64,
    pub transfer_concurrency: usize,
    pub transfer_chunk_size: usize,
    pub progress_interval_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            known_hosts_path: None,
            default_host_key_policy: HostKeyPolicy::Ask,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL.as_secs(),
            prompt_timeout_secs: DEFAULT_PROMPT_TIMEOUT.as_secs(),
            transfer_concurrency: DEFAULT_CONCURRENT_TRANSFERS,
            transfer_chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL.as_millis() as u64,
        }
    }
}

impl CoreConfig {
    pub fn known_hosts_path(&self, data_dir: &Path) -> PathBuf {
        self.known_hosts_path
            .clone()
            .unwrap_or_else(|| data_dir.join("known_hosts"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage for `<data_dir>/config.json`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("config.json"),
        }
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load configuration from disk
    ///
    /// Returns defaults if the file doesn't exist. A corrupted file is
    /// backed up and replaced by defaults.
    pub async fn load(&self) -> Result<CoreConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<CoreConfig>(&contents) {
                Ok(config) => {
                    if config.version > CONFIG_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: config.version,
                            supported: CONFIG_VERSION,
                        });
                    }
                    Ok(config)
                }
                Err(e) => {
                    tracing::warn!("Config file corrupted: {}", e);
                    match self.backup().await {
                        Ok(backup_path) => tracing::warn!(
                            "Corrupted config backed up to {:?}, using defaults",
                            backup_path
                        ),
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted config: {}", backup_err)
                        }
                    }
                    Ok(CoreConfig::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CoreConfig::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save configuration to disk (temp file + rename)
    pub async fn save(&self, config: &CoreConfig) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the current file aside with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if fs::metadata(&self.path).await.is_ok() {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}
