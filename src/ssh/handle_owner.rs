//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to
//! it through a cloneable [`HandleController`] that sends commands over an
//! mpsc channel and receives replies on oneshots. This keeps the handle out
//! of any lock and serializes protocol requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, Pty};
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::session::spawn_shell_pump;
use super::transport::{PtySize, RemoteFs, ShellChannel, Transport, TunnelStream};
use crate::sftp::SftpFs;

/// How long a keep-alive reply may take
const KEEPALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for PTY/shell or subsystems)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (for tunnels)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Send a keep-alive global request
    Keepalive {
        reply_tx: oneshot::Sender<Result<(), SshError>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the sender). Any holder has full control of the
/// connection, so controllers never leave the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    label: String,
}

impl HandleController {
    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip_channel(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Send a keep-alive probe
    pub async fn ping(&self) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::Keepalive { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    /// Ask the owner task to disconnect
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

#[async_trait]
impl Transport for HandleController {
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, SshError> {
        let channel = self.open_session_channel().await?;

        let modes = [
            (Pty::ECHO, 1),
            (Pty::TTY_OP_ISPEED, 14400),
            (Pty::TTY_OP_OSPEED, 14400),
        ];
        channel
            .request_pty(false, "xterm-256color", size.cols, size.rows, 0, 0, &modes)
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        debug!("Shell started on {} ({}x{})", self.label, size.cols, size.rows);
        Ok(spawn_shell_pump(channel, self.label.clone()))
    }

    async fn open_file_system(&self) -> Result<Arc<dyn RemoteFs>, SshError> {
        let channel = self.open_session_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::ChannelError(format!("SFTP subsystem failed: {}", e)))?;
        let sftp = RusshSftpSession::new(channel.into_stream()).await?;
        debug!("SFTP subsystem started on {}", self.label);
        Ok(Arc::new(SftpFs::new(sftp)))
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<TunnelStream, SshError> {
        let channel = self
            .open_direct_tcpip_channel(host, port as u32, "127.0.0.1", 0)
            .await?;
        debug!("Tunnel channel to {}:{} opened on {}", host, port, self.label);
        Ok(Box::new(channel.into_stream()))
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        self.ping().await
    }

    async fn close(&self) {
        self.disconnect().await;
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a controller for it.
/// `label` is only used for logging.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    label: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let task_label = label.clone();

    tokio::spawn(async move {
        let label = task_label;

        info!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        // Channel is dropped, server closes it
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::Keepalive { reply_tx } => {
                    debug!("Keepalive probe for {}", label);
                    let result = match tokio::time::timeout(
                        KEEPALIVE_REPLY_TIMEOUT,
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(SshError::from(e)),
                        Err(_) => Err(SshError::Timeout("keepalive reply".to_string())),
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx, label }
}

/// Drain all pending commands, returning Disconnected to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Keepalive { reply_tx } => {
                let _ = reply_tx.send(Err(SshError::Disconnected));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (HandleController, mpsc::Receiver<HandleCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        (
            HandleController {
                cmd_tx,
                label: "test:22".to_string(),
            },
            cmd_rx,
        )
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (controller, mut cmd_rx) = controller();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let HandleCommand::Keepalive { reply_tx } = cmd {
                    let _ = reply_tx.send(Ok(()));
                }
            }
        });

        controller.keepalive().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_owner_reports_disconnected() {
        let (controller, cmd_rx) = controller();
        drop(cmd_rx);

        assert!(!controller.is_connected());
        assert!(matches!(controller.ping().await, Err(SshError::Disconnected)));
        assert!(matches!(
            controller.open_session_channel().await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_drain_answers_pending() {
        let (controller, mut cmd_rx) = controller();
        let pinger = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.ping().await })
        };

        // Let the ping land in the queue, then drain without answering
        tokio::task::yield_now().await;
        while cmd_rx.is_empty() {
            tokio::task::yield_now().await;
        }
        drain_pending_commands(&mut cmd_rx);

        assert!(matches!(pinger.await.unwrap(), Err(SshError::Disconnected)));
    }
}
