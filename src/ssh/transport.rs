//! Transport abstractions
//!
//! The registry owns connections as `Arc<dyn Transport>`; terminals,
//! transfers and tunnels only ever see these traits. The russh-backed
//! implementations live in `handle_owner` and `sftp::remote_fs`.

use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use super::error::SshError;
use super::known_hosts::HostKeyPolicy;

/// Pseudo-terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl PtySize {
    pub const DEFAULT: PtySize = PtySize { cols: 80, rows: 24 };
}

impl Default for PtySize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Out-of-band requests for a running shell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellControl {
    Resize(PtySize),
    Close,
}

/// How a remote shell ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellExit {
    /// Remote reported an exit status
    Status(u32),
    /// Channel closed without reporting a status
    Closed,
    /// Killed by a signal or the channel failed
    Failed(String),
}

impl ShellExit {
    pub fn code(&self) -> i32 {
        match self {
            ShellExit::Status(status) => *status as i32,
            ShellExit::Closed => 0,
            ShellExit::Failed(_) => 1,
        }
    }
}

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An interactive shell opened over a connection
pub struct ShellChannel {
    pub stdin: RemoteWriter,
    pub stdout: RemoteReader,
    pub stderr: RemoteReader,
    pub control: mpsc::Sender<ShellControl>,
    /// Fires once when the remote shell is gone
    pub exit: oneshot::Receiver<ShellExit>,
}

/// Bidirectional byte stream carried by a channel
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Subset of file attributes the core cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub size: u64,
    pub is_dir: bool,
    /// Mode bits as reported by the server
    pub permissions: u32,
    /// Seconds since the epoch
    pub mtime: i64,
}

#[derive(Debug, Clone)]
pub struct RemoteDirEntry {
    pub name: String,
    pub metadata: RemoteMetadata,
}

/// Remote file protocol session
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn open_read(&self, path: &str) -> Result<RemoteReader, SshError>;
    /// Create or truncate `path` for writing
    async fn create(&self, path: &str) -> Result<RemoteWriter, SshError>;
    async fn metadata(&self, path: &str) -> Result<RemoteMetadata, SshError>;
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SshError>;
    async fn create_dir(&self, path: &str) -> Result<(), SshError>;
    async fn remove_file(&self, path: &str) -> Result<(), SshError>;
    async fn remove_dir(&self, path: &str) -> Result<(), SshError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), SshError>;
}

/// A live, authenticated connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session channel with a PTY and start the login shell
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, SshError>;

    /// Start the file protocol subsystem on a fresh channel
    async fn open_file_system(&self) -> Result<Arc<dyn RemoteFs>, SshError>;

    /// Open a channel the server connects to `host:port` on our behalf
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<TunnelStream, SshError>;

    /// Send one keep-alive request and wait for the reply
    async fn keepalive(&self) -> Result<(), SshError>;

    /// Tear the connection down
    async fn close(&self);
}

/// Resolved authentication material
#[derive(Clone)]
pub enum Credentials {
    Password(String),
    PrivateKey(Arc<PrivateKey>),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(***)"),
            Credentials::PrivateKey(_) => f.write_str("PrivateKey(***)"),
        }
    }
}

/// Everything needed to dial and authenticate one endpoint
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub host_key_policy: HostKeyPolicy,
}

/// Dials and authenticates a [`ConnectTarget`]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: ConnectTarget) -> Result<Arc<dyn Transport>, SshError>;
}
