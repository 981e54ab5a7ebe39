//! SFTP data types

use serde::{Deserialize, Serialize};

/// Remote directory entry as returned by the file browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// File name (not full path)
    pub name: String,
    /// Full path
    pub path: String,
    pub is_dir: bool,
    /// File size in bytes
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    /// Last modified time (Unix timestamp)
    pub mtime: i64,
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    /// Waiting for a concurrency slot
    Queued,
    /// Currently transferring
    Running,
    /// Completed successfully
    Done,
    /// Failed or canceled
    Error,
}

impl TransferState {
    pub fn is_finished(self) -> bool {
        matches!(self, TransferState::Done | TransferState::Error)
    }
}

/// One queued or finished transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: String,
    pub session_id: String,
    pub local_path: String,
    pub remote_path: String,
    pub direction: TransferDirection,
    pub total_bytes: u64,
    pub done_bytes: u64,
    pub state: TransferState,
    /// Error message if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferTask {
    /// Progress percentage (0-100)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.done_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// `transfer:progress` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgressEvent {
    pub task_id: String,
    pub session_id: String,
    pub local_path: String,
    pub remote_path: String,
    pub direction: TransferDirection,
    pub done_bytes: u64,
    pub total_bytes: u64,
    /// Bytes per second since the previous progress event
    pub speed_bytes: u64,
    pub state: TransferState,
}

/// `transfer:done` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDoneEvent {
    pub task_id: String,
    pub session_id: String,
    pub local_path: String,
    pub remote_path: String,
    pub direction: TransferDirection,
}

/// `transfer:error` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferErrorEvent {
    pub task_id: String,
    pub session_id: String,
    pub local_path: String,
    pub remote_path: String,
    pub direction: TransferDirection,
    pub message: String,
}
