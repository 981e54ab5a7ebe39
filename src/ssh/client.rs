//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::known_hosts::{HostIdentity, HostKeyPolicy, HostKeyVerifier, KnownHostsStore};
use super::transport::{ConnectTarget, Connector, Credentials, Transport};

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// russh-backed [`Connector`]
pub struct SshConnector {
    verifier: Arc<HostKeyVerifier>,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(verifier: Arc<HostKeyVerifier>, connect_timeout: Duration) -> Self {
        Self {
            verifier,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: ConnectTarget) -> Result<Arc<dyn Transport>, SshError> {
        let addr = format!("{}:{}", target.host, target.port);
        info!("Connecting to SSH server at {}", addr);

        // The timeout bounds reaching the server, not the handshake: an
        // unknown host key may wait on a human for much longer.
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SshError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| SshError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        let ssh_config = client::Config {
            // Liveness is the registry's keep-alive task
            inactivity_timeout: None,
            ..Default::default()
        };

        let handler = ClientHandler {
            label: KnownHostsStore::make_key(&target.host, target.port),
            policy: target.host_key_policy,
            verifier: self.verifier.clone(),
        };

        let mut handle = client::connect_stream(Arc::new(ssh_config), stream, handler).await?;
        debug!("SSH handshake completed with {}", addr);

        let authenticated = match &target.credentials {
            Credentials::Password(password) => handle
                .authenticate_password(&target.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            Credentials::PrivateKey(key) => {
                let key_with_hash = PrivateKeyWithHashAlg::new(key.clone(), None);
                handle
                    .authenticate_publickey(&target.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}@{}", target.username, addr);

        Ok(Arc::new(spawn_handle_owner_task(handle, addr)))
    }
}

/// Client handler for russh callbacks
///
/// Routes host key checks through the shared [`HostKeyVerifier`] using the
/// connecting profile's policy.
pub struct ClientHandler {
    label: String,
    policy: HostKeyPolicy,
    verifier: Arc<HostKeyVerifier>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let identity = HostIdentity::from_public_key(server_public_key);
        self.verifier
            .verify(&self.label, &identity, self.policy)
            .await?;
        Ok(true)
    }
}
