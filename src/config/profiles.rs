//! Connection profiles
//!
//! Plain records keyed by id. The registry only needs [`ProfileSource::get`];
//! the JSON file store is what a standalone embedding uses.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::ssh::HostKeyPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl serde::Serialize for ProfileError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
    /// Password read from the vault
    Password,
    /// Key file, passphrase (if any) read from the vault
    PrivateKey,
}

fn default_port() -> u16 {
    22
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub group: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    /// Password auth is only attempted when the secret lives in the vault
    #[serde(default)]
    pub use_keyring: bool,
    /// Overrides the configured default policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_policy: Option<HostKeyPolicy>,
}

impl Profile {
    /// Port 0 means "unset"
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            22
        } else {
            self.port
        }
    }
}

/// Profile CRUD
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn get(&self, id: &str) -> Result<Profile, ProfileError>;
    async fn list(&self) -> Result<Vec<Profile>, ProfileError>;
    /// Insert or replace by id
    async fn save(&self, profile: Profile) -> Result<(), ProfileError>;
    async fn delete(&self, id: &str) -> Result<(), ProfileError>;
}

/// Profiles persisted as a JSON array
pub struct JsonProfileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonProfileStore {
    /// Store for `<data_dir>/profiles.json`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::with_path(data_dir.join("profiles.json"))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<Vec<Profile>, ProfileError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(Vec::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, profiles: &[Profile]) -> Result<(), ProfileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(profiles)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileSource for JsonProfileStore {
    async fn get(&self, id: &str) -> Result<Profile, ProfileError> {
        self.read_all()
            .await?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Profile>, ProfileError> {
        self.read_all().await
    }

    async fn save(&self, profile: Profile) -> Result<(), ProfileError> {
        let _guard = self.lock.lock().await;
        let mut profiles = self.read_all().await?;
        match profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => profiles.push(profile),
        }
        self.write_all(&profiles).await
    }

    async fn delete(&self, id: &str) -> Result<(), ProfileError> {
        let _guard = self.lock.lock().await;
        let mut profiles = self.read_all().await?;
        let before = profiles.len();
        profiles.retain(|p| p.id != id);
        if profiles.len() == before {
            return Err(ProfileError::NotFound(id.to_string()));
        }
        self.write_all(&profiles).await
    }
}
