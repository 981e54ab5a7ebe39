//! Interactive shell channel pump
//!
//! One task owns the russh `Channel` of a shell. It forwards stdin from a
//! duplex pipe into the channel, splits channel output into stdout and
//! stderr pipes, applies resize/close requests, and reports how the shell
//! ended.

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::transport::{ShellChannel, ShellControl, ShellExit};

/// Buffer size of each in-process pipe
const PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) fn spawn_shell_pump(mut channel: Channel<Msg>, label: String) -> ShellChannel {
    let (stdin, mut stdin_rx) = tokio::io::duplex(PIPE_CAPACITY);
    let (stdout_tx, stdout) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr_tx, stderr) = tokio::io::duplex(PIPE_CAPACITY);
    let (control, mut control_rx) = mpsc::channel::<ShellControl>(16);
    let (exit_tx, exit) = oneshot::channel();

    tokio::spawn(async move {
        let mut stdout_tx = Some(stdout_tx);
        let mut stderr_tx = Some(stderr_tx);
        let mut stdin_open = true;
        let mut exit_status: Option<u32> = None;
        let mut failure: Option<String> = None;
        let mut buf = vec![0u8; 8192];

        debug!("Shell pump started on {}", label);

        loop {
            tokio::select! {
                read = stdin_rx.read(&mut buf), if stdin_open => {
                    match read {
                        Ok(0) | Err(_) => {
                            stdin_open = false;
                            let _ = channel.eof().await;
                        }
                        Ok(n) => {
                            if let Err(e) = channel.data(&buf[..n]).await {
                                warn!("Failed to send data to shell on {}: {}", label, e);
                                failure = Some(e.to_string());
                                break;
                            }
                        }
                    }
                }

                Some(control) = control_rx.recv() => {
                    match control {
                        ShellControl::Resize(size) => {
                            if let Err(e) = channel.window_change(size.cols, size.rows, 0, 0).await {
                                // A failed resize leaves the shell usable
                                warn!("Failed to resize PTY on {}: {}", label, e);
                            }
                        }
                        ShellControl::Close => {
                            debug!("Close requested for shell on {}", label);
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            forward(&mut stdout_tx, &data).await;
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            if ext == 1 {
                                forward(&mut stderr_tx, &data).await;
                            }
                        }
                        Some(ChannelMsg::Eof) => {
                            // Exit status usually follows EOF
                            stdout_tx = None;
                            stderr_tx = None;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                            exit_status = Some(status);
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, error_message, .. }) => {
                            failure = Some(format!("killed by signal {:?}: {}", signal_name, error_message));
                        }
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    }
                }
            }
        }

        // Dropping the writers delivers EOF to the readers
        drop(stdout_tx);
        drop(stderr_tx);

        let outcome = match (exit_status, failure) {
            (Some(status), _) => ShellExit::Status(status),
            (None, Some(reason)) => ShellExit::Failed(reason),
            (None, None) => ShellExit::Closed,
        };
        info!("Shell on {} ended: {:?}", label, outcome);
        let _ = exit_tx.send(outcome);
    });

    ShellChannel {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
        control,
        exit,
    }
}

/// Write a chunk to a reader pipe, dropping the pipe once nobody listens
async fn forward(pipe: &mut Option<DuplexStream>, data: &[u8]) {
    if let Some(writer) = pipe.as_mut() {
        if writer.write_all(data).await.is_err() {
            *pipe = None;
        }
    }
}
