//! SSH module - handles SSH connections and sessions
//!
//! This module provides the transport layer using the russh library.
//!
//! # Features
//! - Trust-on-first-use host key verification against a known_hosts file
//! - Out-of-band host key prompts with timeout
//! - Handle owner task serializing all access to a `russh` client handle
//! - PTY shells, SFTP subsystem and `direct-tcpip` channels

pub mod client;
mod error;
mod handle_owner;
pub mod host_key_prompt;
pub mod known_hosts;
mod session;
pub mod transport;

pub use client::SshConnector;
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use host_key_prompt::{
    HostKeyPrompt, HostKeyPromptBroker, PromptError, PromptOutcome, DEFAULT_PROMPT_TIMEOUT,
};
pub use known_hosts::{
    HostIdentity, HostKeyPolicy, HostKeyVerification, HostKeyVerifier, KnownHostsStore,
};
pub use transport::{
    ConnectTarget, Connector, Credentials, PtySize, RemoteFs, ShellChannel, Transport,
    TunnelStream,
};
