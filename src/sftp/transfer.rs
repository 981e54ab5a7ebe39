//! Transfer queue for SFTP uploads and downloads
//!
//! Submissions register a `queued` task and return at once. Each task then
//! waits for a slot on a fixed-size semaphore, copies in fixed-size chunks
//! and reports progress on a fixed cadence. Cancellation is cooperative:
//! the copy loop checks the task's token before every read.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    TransferDirection, TransferDoneEvent, TransferErrorEvent, TransferProgressEvent,
    TransferState, TransferTask,
};
use crate::events::{EventEmitter, TRANSFER_DONE, TRANSFER_ERROR, TRANSFER_PROGRESS};
use crate::session::{ConnectionRegistry, RegistryError};
use crate::ssh::transport::{RemoteReader, RemoteWriter};
use crate::ssh::SshError;

/// Default concurrent transfers
pub const DEFAULT_CONCURRENT_TRANSFERS: usize = 2;

/// Default copy chunk (32 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Default progress cadence
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Transfer not found: {0}")]
    NotFound(String),

    #[error("task not started")]
    NotStarted(String),

    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl serde::Serialize for TransferError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct TaskEntry {
    task: RwLock<TransferTask>,
    /// Populated once the task holds a concurrency slot
    cancel: Mutex<Option<CancellationToken>>,
}

impl TaskEntry {
    fn snapshot(&self) -> TransferTask {
        self.task.read().clone()
    }

    fn set_state(&self, state: TransferState) {
        self.task.write().state = state;
    }

    /// Add `n` bytes; returns (done, total)
    fn advance(&self, n: u64) -> (u64, u64) {
        let mut task = self.task.write();
        task.done_bytes += n;
        if task.done_bytes > task.total_bytes {
            task.total_bytes = task.done_bytes;
        }
        (task.done_bytes, task.total_bytes)
    }
}

/// Last progress emission, for the throughput estimate
struct ProgressMark {
    at: Instant,
    done: u64,
}

pub struct TransferQueue {
    registry: Arc<ConnectionRegistry>,
    tasks: DashMap<String, Arc<TaskEntry>>,
    semaphore: Arc<Semaphore>,
    emitter: EventEmitter,
    chunk_size: usize,
    progress_interval: Duration,
}

impl TransferQueue {
    pub fn new(registry: Arc<ConnectionRegistry>, emitter: EventEmitter) -> Self {
        Self::with_limits(
            registry,
            emitter,
            DEFAULT_CONCURRENT_TRANSFERS,
            DEFAULT_CHUNK_SIZE,
            DEFAULT_PROGRESS_INTERVAL,
        )
    }

    pub fn with_limits(
        registry: Arc<ConnectionRegistry>,
        emitter: EventEmitter,
        concurrency: usize,
        chunk_size: usize,
        progress_interval: Duration,
    ) -> Self {
        Self {
            registry,
            tasks: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            emitter,
            chunk_size: chunk_size.max(1),
            progress_interval,
        }
    }

    /// Queue `remote_path` -> `local_path`
    pub fn download(self: &Arc<Self>, session_id: &str, remote_path: &str, local_path: &str) -> String {
        self.submit(session_id, local_path, remote_path, TransferDirection::Download)
    }

    /// Queue `local_path` -> `remote_path`
    pub fn upload(self: &Arc<Self>, session_id: &str, local_path: &str, remote_path: &str) -> String {
        self.submit(session_id, local_path, remote_path, TransferDirection::Upload)
    }

    fn submit(
        self: &Arc<Self>,
        session_id: &str,
        local_path: &str,
        remote_path: &str,
        direction: TransferDirection,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = Arc::new(TaskEntry {
            task: RwLock::new(TransferTask {
                id: id.clone(),
                session_id: session_id.to_string(),
                local_path: local_path.to_string(),
                remote_path: remote_path.to_string(),
                direction,
                total_bytes: 0,
                done_bytes: 0,
                state: TransferState::Queued,
                error: None,
            }),
            cancel: Mutex::new(None),
        });
        self.tasks.insert(id.clone(), entry.clone());

        info!(
            "Queued {:?} {}: local={} remote={}",
            direction, id, local_path, remote_path
        );
        tokio::spawn(Arc::clone(self).run(entry));
        id
    }

    async fn run(self: Arc<Self>, entry: Arc<TaskEntry>) {
        let Ok(_permit) = self.semaphore.clone().acquire_owned().await else {
            self.fail(&entry, "transfer queue closed".to_string());
            return;
        };

        let token = CancellationToken::new();
        *entry.cancel.lock() = Some(token.clone());
        entry.set_state(TransferState::Running);
        debug!("Transfer {} started", entry.task.read().id);

        match self.execute(&entry, &token).await {
            Ok(()) => self.finish(&entry),
            Err(e) => self.fail(&entry, e.to_string()),
        }
    }

    async fn execute(&self, entry: &TaskEntry, token: &CancellationToken) -> Result<(), TransferError> {
        let task = entry.snapshot();
        let transport = self.registry.fetch_connection(&task.session_id)?;
        let fs = transport.open_file_system().await?;

        let (mut reader, total, mut writer): (RemoteReader, u64, RemoteWriter) = match task.direction {
            TransferDirection::Download => {
                let total = fs.metadata(&task.remote_path).await?.size;
                let reader = fs.open_read(&task.remote_path).await?;
                let writer = tokio::fs::File::create(&task.local_path).await?;
                (reader, total, Box::new(writer))
            }
            TransferDirection::Upload => {
                let file = tokio::fs::File::open(&task.local_path).await?;
                let total = file.metadata().await?.len();
                let writer = fs.create(&task.remote_path).await?;
                (Box::new(file), total, writer)
            }
        };
        entry.task.write().total_bytes = total;

        self.copy_with_progress(entry, token, &mut reader, &mut writer)
            .await
    }

    async fn copy_with_progress(
        &self,
        entry: &TaskEntry,
        token: &CancellationToken,
        reader: &mut RemoteReader,
        writer: &mut RemoteWriter,
    ) -> Result<(), TransferError> {
        let mut buf = vec![0u8; self.chunk_size];
        let started = Instant::now();
        let mut last: Option<ProgressMark> = None;

        loop {
            if token.is_cancelled() {
                return Err(TransferError::Canceled);
            }
            let n = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TransferError::Canceled),
                read = reader.read(&mut buf) => read?,
            };
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            let (done, total) = entry.advance(n as u64);

            let now = Instant::now();
            let since = last.as_ref().map_or(started, |mark| mark.at);
            if now.duration_since(since) < self.progress_interval {
                continue;
            }
            let speed = match &last {
                None => 0,
                Some(mark) => {
                    let secs = now.duration_since(mark.at).as_secs_f64();
                    ((done - mark.done) as f64 / secs) as u64
                }
            };
            self.emit_progress(entry, done, total, speed);
            last = Some(ProgressMark { at: now, done });
        }

        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }

    fn emit_progress(&self, entry: &TaskEntry, done: u64, total: u64, speed: u64) {
        let task = entry.task.read();
        self.emitter.emit(
            TRANSFER_PROGRESS,
            &TransferProgressEvent {
                task_id: task.id.clone(),
                session_id: task.session_id.clone(),
                local_path: task.local_path.clone(),
                remote_path: task.remote_path.clone(),
                direction: task.direction,
                done_bytes: done,
                total_bytes: total,
                speed_bytes: speed,
                state: task.state,
            },
        );
    }

    fn finish(&self, entry: &TaskEntry) {
        entry.set_state(TransferState::Done);
        let task = entry.snapshot();
        self.emit_progress(entry, task.done_bytes, task.total_bytes, 0);
        self.emitter.emit(
            TRANSFER_DONE,
            &TransferDoneEvent {
                task_id: task.id.clone(),
                session_id: task.session_id.clone(),
                local_path: task.local_path.clone(),
                remote_path: task.remote_path.clone(),
                direction: task.direction,
            },
        );
        info!("Transfer {} done ({} bytes)", task.id, task.done_bytes);
    }

    fn fail(&self, entry: &TaskEntry, message: String) {
        let task = {
            let mut task = entry.task.write();
            task.state = TransferState::Error;
            task.error = Some(message.clone());
            task.clone()
        };
        warn!("Transfer {} failed: {}", task.id, message);
        self.emitter.emit(
            TRANSFER_ERROR,
            &TransferErrorEvent {
                task_id: task.id,
                session_id: task.session_id,
                local_path: task.local_path,
                remote_path: task.remote_path,
                direction: task.direction,
                message,
            },
        );
    }

    /// Signal a running task to stop at its next check point
    pub fn cancel(&self, task_id: &str) -> Result<(), TransferError> {
        let entry = self
            .tasks
            .get(task_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransferError::NotFound(task_id.to_string()))?;

        let token = entry
            .cancel
            .lock()
            .clone()
            .ok_or_else(|| TransferError::NotStarted(task_id.to_string()))?;
        token.cancel();
        info!("Cancel requested for transfer {}", task_id);
        Ok(())
    }

    pub fn list_tasks(&self) -> Vec<TransferTask> {
        self.tasks.iter().map(|e| e.value().snapshot()).collect()
    }

    pub fn task(&self, task_id: &str) -> Option<TransferTask> {
        self.tasks.get(task_id).map(|e| e.value().snapshot())
    }
}
