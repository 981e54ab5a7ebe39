//! russh-sftp backed [`RemoteFs`]

use async_trait::async_trait;
use russh_sftp::client::fs::Metadata;
use russh_sftp::client::SftpSession as RusshSftpSession;

use crate::ssh::transport::{RemoteDirEntry, RemoteFs, RemoteMetadata, RemoteReader, RemoteWriter};
use crate::ssh::SshError;

/// One SFTP subsystem channel
pub struct SftpFs {
    sftp: RusshSftpSession,
}

impl SftpFs {
    pub fn new(sftp: RusshSftpSession) -> Self {
        Self { sftp }
    }
}

fn convert(metadata: &Metadata) -> RemoteMetadata {
    RemoteMetadata {
        size: metadata.size.unwrap_or(0),
        is_dir: metadata.is_dir(),
        permissions: metadata.permissions.unwrap_or(0),
        mtime: metadata.mtime.map(|t| t as i64).unwrap_or(0),
    }
}

/// Attach the path to protocol errors so callers see what failed
fn map_err(err: russh_sftp::client::error::Error, path: &str) -> SshError {
    SshError::SftpError(format!("{}: {}", path, err))
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn open_read(&self, path: &str) -> Result<RemoteReader, SshError> {
        let file = self.sftp.open(path).await.map_err(|e| map_err(e, path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SshError> {
        let file = self.sftp.create(path).await.map_err(|e| map_err(e, path))?;
        Ok(Box::new(file))
    }

    async fn metadata(&self, path: &str) -> Result<RemoteMetadata, SshError> {
        let metadata = self.sftp.metadata(path).await.map_err(|e| map_err(e, path))?;
        Ok(convert(&metadata))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SshError> {
        let read_dir = self.sftp.read_dir(path).await.map_err(|e| map_err(e, path))?;
        Ok(read_dir
            .map(|entry| RemoteDirEntry {
                name: entry.file_name(),
                metadata: convert(&entry.metadata()),
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SshError> {
        self.sftp.create_dir(path).await.map_err(|e| map_err(e, path))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SshError> {
        self.sftp.remove_file(path).await.map_err(|e| map_err(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SshError> {
        self.sftp.remove_dir(path).await.map_err(|e| map_err(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SshError> {
        self.sftp.rename(from, to).await.map_err(|e| map_err(e, from))
    }
}
