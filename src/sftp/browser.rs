//! Remote file browser
//!
//! Directory listing and simple file management over a session's file
//! protocol channel.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{debug, info};

use super::path_utils::{join_remote_path, remote_file_name};
use super::types::FileEntry;
use crate::session::{ConnectionRegistry, RegistryError};
use crate::ssh::transport::{RemoteFs, RemoteMetadata};
use crate::ssh::SshError;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("Directory requires recursive remove: {0}")]
    NotRecursive(String),
}

impl serde::Serialize for BrowserError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

fn to_entry(name: &str, path: String, meta: &RemoteMetadata) -> FileEntry {
    FileEntry {
        name: name.to_string(),
        path,
        is_dir: meta.is_dir,
        size: meta.size,
        mode: meta.permissions,
        mtime: meta.mtime,
    }
}

pub struct FileBrowser {
    registry: Arc<ConnectionRegistry>,
}

impl FileBrowser {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    async fn fs(&self, session_id: &str) -> Result<Arc<dyn RemoteFs>, BrowserError> {
        let transport = self.registry.fetch_connection(session_id)?;
        Ok(transport.open_file_system().await?)
    }

    /// Directories first, then by name
    pub async fn list(&self, session_id: &str, path: &str) -> Result<Vec<FileEntry>, BrowserError> {
        let fs = self.fs(session_id).await?;
        let mut entries: Vec<FileEntry> = fs
            .read_dir(path)
            .await?
            .into_iter()
            .filter(|e| e.name != "." && e.name != "..")
            .map(|e| to_entry(&e.name, join_remote_path(path, &e.name), &e.metadata))
            .collect();

        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        debug!("Listed {} ({} entries)", path, entries.len());
        Ok(entries)
    }

    pub async fn stat(&self, session_id: &str, path: &str) -> Result<FileEntry, BrowserError> {
        let fs = self.fs(session_id).await?;
        let meta = fs.metadata(path).await?;
        Ok(to_entry(remote_file_name(path), path.to_string(), &meta))
    }

    pub async fn mkdir(&self, session_id: &str, path: &str) -> Result<(), BrowserError> {
        let fs = self.fs(session_id).await?;
        fs.create_dir(path).await?;
        info!("Created remote directory {}", path);
        Ok(())
    }

    /// Remove a file. A directory is only removed, with everything below
    /// it, when `recursive` is set.
    pub async fn remove(
        &self,
        session_id: &str,
        path: &str,
        recursive: bool,
    ) -> Result<(), BrowserError> {
        let fs = self.fs(session_id).await?;
        if fs.metadata(path).await?.is_dir {
            if !recursive {
                return Err(BrowserError::NotRecursive(path.to_string()));
            }
            remove_dir_recursive(fs.as_ref(), path.to_string()).await?;
        } else {
            fs.remove_file(path).await?;
        }
        info!("Removed remote path {}", path);
        Ok(())
    }

    pub async fn rename(&self, session_id: &str, from: &str, to: &str) -> Result<(), BrowserError> {
        let fs = self.fs(session_id).await?;
        fs.rename(from, to).await?;
        info!("Renamed {} -> {}", from, to);
        Ok(())
    }
}

// Boxed to allow recursion
fn remove_dir_recursive(fs: &dyn RemoteFs, path: String) -> BoxFuture<'_, Result<(), SshError>> {
    Box::pin(async move {
        for entry in fs.read_dir(&path).await? {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            let child = join_remote_path(&path, &entry.name);
            if entry.metadata.is_dir {
                remove_dir_recursive(fs, child).await?;
            } else {
                fs.remove_file(&child).await?;
            }
        }
        fs.remove_dir(&path).await
    })
}
