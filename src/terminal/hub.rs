//! Terminal Hub
//!
//! Interactive shells multiplexed over registry connections. Each open
//! terminal runs three tasks: a stdout reader, a stderr reader and an exit
//! waiter. The waiter owns final cleanup; `close` may race it safely since
//! removal from the active set is idempotent.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventEmitter, TERMINAL_DATA, TERMINAL_EXIT};
use crate::session::{ConnectionRegistry, RegistryError};
use crate::ssh::transport::{PtySize, RemoteReader, RemoteWriter, ShellControl, ShellExit};
use crate::ssh::SshError;

/// Read buffer for each output stream
const READ_BUFFER_SIZE: usize = 4096;

/// Chunk emitted once when an output stream fails
pub const STREAM_ERROR_CHUNK: &[u8] = b"\r\n[terminal stream error]\r\n";

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Terminal not found: {0}")]
    NotFound(String),

    #[error("Invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u32, rows: u32 },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Terminal closed: {0}")]
    Closed(String),
}

impl serde::Serialize for TerminalError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// `terminal:data` payload; `chunk` is base64
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalDataEvent {
    pub term_id: String,
    pub chunk: String,
}

impl TerminalDataEvent {
    pub fn new(term_id: &str, bytes: &[u8]) -> Self {
        Self {
            term_id: term_id.to_string(),
            chunk: BASE64.encode(bytes),
        }
    }

    /// Raw bytes carried by this event
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.chunk)
    }
}

/// `terminal:exit` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExitEvent {
    pub term_id: String,
    pub code: i32,
}

/// Snapshot of an open terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub term_id: String,
    pub session_id: String,
    pub cols: u32,
    pub rows: u32,
}

struct Terminal {
    id: String,
    session_id: String,
    stdin: tokio::sync::Mutex<RemoteWriter>,
    control: mpsc::Sender<ShellControl>,
    size: Mutex<PtySize>,
}

impl Terminal {
    fn info(&self) -> TerminalInfo {
        let size = *self.size.lock();
        TerminalInfo {
            term_id: self.id.clone(),
            session_id: self.session_id.clone(),
            cols: size.cols,
            rows: size.rows,
        }
    }
}

pub struct TerminalHub {
    registry: Arc<ConnectionRegistry>,
    terminals: Arc<DashMap<String, Arc<Terminal>>>,
    emitter: EventEmitter,
}

impl TerminalHub {
    pub fn new(registry: Arc<ConnectionRegistry>, emitter: EventEmitter) -> Self {
        Self {
            registry,
            terminals: Arc::new(DashMap::new()),
            emitter,
        }
    }

    /// Open a shell on `session_id`. A zero dimension falls back to 80x24.
    pub async fn open(&self, session_id: &str, cols: u32, rows: u32) -> Result<String, TerminalError> {
        let size = PtySize {
            cols: if cols == 0 { PtySize::DEFAULT.cols } else { cols },
            rows: if rows == 0 { PtySize::DEFAULT.rows } else { rows },
        };

        let transport = self.registry.fetch_connection(session_id)?;
        let shell = transport.open_shell(size).await?;

        let term_id = Uuid::new_v4().to_string();
        let terminal = Arc::new(Terminal {
            id: term_id.clone(),
            session_id: session_id.to_string(),
            stdin: tokio::sync::Mutex::new(shell.stdin),
            control: shell.control,
            size: Mutex::new(size),
        });
        // Registered before any reader can observe the shell ending
        self.terminals.insert(term_id.clone(), terminal);

        let stdout = tokio::spawn(pump_output(
            term_id.clone(),
            shell.stdout,
            self.emitter.clone(),
        ));
        let stderr = tokio::spawn(pump_output(
            term_id.clone(),
            shell.stderr,
            self.emitter.clone(),
        ));

        let waiter_id = term_id.clone();
        let terminals = self.terminals.clone();
        let emitter = self.emitter.clone();
        let exit = shell.exit;
        tokio::spawn(async move {
            let outcome = exit
                .await
                .unwrap_or_else(|_| ShellExit::Failed("shell task ended".to_string()));
            wait_readers([stdout, stderr]).await;

            let code = outcome.code();
            info!("Terminal {} exited ({:?}, code {})", waiter_id, outcome, code);
            emitter.emit(
                TERMINAL_EXIT,
                &TerminalExitEvent {
                    term_id: waiter_id.clone(),
                    code,
                },
            );
            terminals.remove(&waiter_id);
        });

        info!(
            "Opened terminal {} on session {} ({}x{})",
            term_id, session_id, size.cols, size.rows
        );
        Ok(term_id)
    }

    fn get(&self, term_id: &str) -> Result<Arc<Terminal>, TerminalError> {
        self.terminals
            .get(term_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| TerminalError::NotFound(term_id.to_string()))
    }

    /// Send input bytes to the shell
    pub async fn write(&self, term_id: &str, data: &[u8]) -> Result<(), TerminalError> {
        let terminal = self.get(term_id)?;
        let mut stdin = terminal.stdin.lock().await;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn resize(&self, term_id: &str, cols: u32, rows: u32) -> Result<(), TerminalError> {
        if cols == 0 || rows == 0 {
            return Err(TerminalError::InvalidSize { cols, rows });
        }
        let terminal = self.get(term_id)?;
        let size = PtySize { cols, rows };

        terminal
            .control
            .send(ShellControl::Resize(size))
            .await
            .map_err(|_| TerminalError::Closed(term_id.to_string()))?;
        *terminal.size.lock() = size;

        debug!("Resized terminal {} to {}x{}", term_id, cols, rows);
        Ok(())
    }

    /// Client-initiated close. Closing an unknown or already closed
    /// terminal succeeds.
    pub async fn close(&self, term_id: &str) -> Result<(), TerminalError> {
        let Some((_, terminal)) = self.terminals.remove(term_id) else {
            debug!("Terminal {} already closed", term_id);
            return Ok(());
        };

        // The shell may already be gone
        let _ = terminal.control.send(ShellControl::Close).await;
        info!("Closed terminal {}", term_id);
        Ok(())
    }

    /// Close every terminal opened on `session_id`
    pub async fn close_for_session(&self, session_id: &str) {
        let ids: Vec<String> = self
            .terminals
            .iter()
            .filter(|t| t.value().session_id == session_id)
            .map(|t| t.key().clone())
            .collect();
        for id in ids {
            let _ = self.close(&id).await;
        }
    }

    pub fn list(&self) -> Vec<TerminalInfo> {
        self.terminals.iter().map(|t| t.value().info()).collect()
    }
}

async fn pump_output(term_id: String, mut reader: RemoteReader, emitter: EventEmitter) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => emitter.emit(TERMINAL_DATA, &TerminalDataEvent::new(&term_id, &buf[..n])),
            Err(e) => {
                warn!("Terminal {} stream error: {}", term_id, e);
                emitter.emit(
                    TERMINAL_DATA,
                    &TerminalDataEvent::new(&term_id, STREAM_ERROR_CHUNK),
                );
                break;
            }
        }
    }
}

/// Let buffered output reach the sink before the exit event
async fn wait_readers(readers: [JoinHandle<()>; 2]) {
    for reader in readers {
        let _ = reader.await;
    }
}
