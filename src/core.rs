//! Core wiring
//!
//! Builds the six components from a data directory: trust store and prompt
//! broker, connection registry, terminal hub, transfer queue, file browser
//! and tunnel dialer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::config::keychain::{Keychain, SecretVault};
use crate::config::profiles::{JsonProfileStore, ProfileSource};
use crate::config::storage::{config_dir, ConfigStorage, CoreConfig, StorageError};
use crate::events::{EventEmitter, EventSink};
use crate::session::{ConnectionRegistry, RegistryError};
use crate::sftp::{FileBrowser, TransferQueue};
use crate::ssh::client::SshConnector;
use crate::ssh::host_key_prompt::HostKeyPromptBroker;
use crate::ssh::known_hosts::{HostKeyVerifier, KnownHostsStore};
use crate::ssh::transport::Connector;
use crate::terminal::TerminalHub;
use crate::tunnel::TunnelDialer;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl serde::Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Collaborators a [`Core`] is assembled from
pub struct CoreParts {
    pub config: CoreConfig,
    pub known_hosts_path: PathBuf,
    pub profiles: Arc<dyn ProfileSource>,
    pub vault: Arc<dyn SecretVault>,
    pub emitter: EventEmitter,
}

pub struct Core {
    config: CoreConfig,
    profiles: Arc<dyn ProfileSource>,
    vault: Arc<dyn SecretVault>,
    trust: Arc<HostKeyVerifier>,
    prompts: Arc<HostKeyPromptBroker>,
    registry: Arc<ConnectionRegistry>,
    terminals: TerminalHub,
    transfers: Arc<TransferQueue>,
    files: FileBrowser,
    tunnels: TunnelDialer,
}

impl Core {
    /// Open with the default data directory (`~/.shellmux`)
    pub async fn open_default(sink: Arc<dyn EventSink>) -> Result<Self, CoreError> {
        let data_dir = config_dir()?;
        Self::open(&data_dir, sink).await
    }

    /// Load `<data_dir>/config.json` and wire production collaborators:
    /// JSON profiles, the OS keychain and a russh connector
    pub async fn open(data_dir: &Path, sink: Arc<dyn EventSink>) -> Result<Self, CoreError> {
        let config = ConfigStorage::in_dir(data_dir).load().await?;
        let connect_timeout = config.connect_timeout();

        let parts = CoreParts {
            known_hosts_path: config.known_hosts_path(data_dir),
            config,
            profiles: Arc::new(JsonProfileStore::in_dir(data_dir)),
            vault: Arc::new(Keychain::new()),
            emitter: EventEmitter::new(sink),
        };

        info!("Opening core in {}", data_dir.display());
        Ok(Self::assemble(parts, |verifier| -> Arc<dyn Connector> {
            Arc::new(SshConnector::new(verifier, connect_timeout))
        }))
    }

    /// Wire components around a connector built from the trust verifier
    pub fn assemble(
        parts: CoreParts,
        make_connector: impl FnOnce(Arc<HostKeyVerifier>) -> Arc<dyn Connector>,
    ) -> Self {
        let CoreParts {
            config,
            known_hosts_path,
            profiles,
            vault,
            emitter,
        } = parts;

        let prompts = Arc::new(HostKeyPromptBroker::new(
            emitter.clone(),
            config.prompt_timeout(),
        ));
        let trust = Arc::new(HostKeyVerifier::new(
            KnownHostsStore::with_path(known_hosts_path),
            Some(prompts.clone()),
        ));
        let connector = make_connector(trust.clone());

        let registry = Arc::new(
            ConnectionRegistry::new(profiles.clone(), vault.clone(), connector, emitter.clone())
                .with_default_policy(config.default_host_key_policy)
                .with_keepalive_interval(config.keepalive_interval()),
        );
        let terminals = TerminalHub::new(registry.clone(), emitter.clone());
        let transfers = Arc::new(TransferQueue::with_limits(
            registry.clone(),
            emitter,
            config.transfer_concurrency,
            config.transfer_chunk_size,
            config.progress_interval(),
        ));
        let files = FileBrowser::new(registry.clone());
        let tunnels = TunnelDialer::new(registry.clone());

        Self {
            config,
            profiles,
            vault,
            trust,
            prompts,
            registry,
            terminals,
            transfers,
            files,
            tunnels,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileSource> {
        &self.profiles
    }

    pub fn vault(&self) -> &Arc<dyn SecretVault> {
        &self.vault
    }

    pub fn trust(&self) -> &Arc<HostKeyVerifier> {
        &self.trust
    }

    pub fn prompts(&self) -> &Arc<HostKeyPromptBroker> {
        &self.prompts
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn terminals(&self) -> &TerminalHub {
        &self.terminals
    }

    pub fn transfers(&self) -> &Arc<TransferQueue> {
        &self.transfers
    }

    pub fn files(&self) -> &FileBrowser {
        &self.files
    }

    pub fn tunnels(&self) -> &TunnelDialer {
        &self.tunnels
    }

    /// Close the session's terminals, then the session itself
    pub async fn disconnect(&self, session_id: &str) -> Result<(), RegistryError> {
        self.terminals.close_for_session(session_id).await;
        self.registry.disconnect(session_id).await
    }

    pub async fn shutdown(&self) {
        info!("Shutting down core");
        for terminal in self.terminals.list() {
            let _ = self.terminals.close(&terminal.term_id).await;
        }
        self.registry.disconnect_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopSink;
    use crate::ssh::host_key_prompt::PromptError;
    use crate::ssh::HostKeyPolicy;
    use crate::testing::{password_profile, FakeConnector, MemoryProfiles, MemoryVault, RecordingSink};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_uses_defaults() {
        let temp = tempdir().unwrap();
        let core = Core::open(temp.path(), Arc::new(NoopSink)).await.unwrap();

        assert_eq!(core.config(), &CoreConfig::default());
        assert_eq!(
            core.trust().store().path(),
            temp.path().join("known_hosts").as_path()
        );
        assert!(core.registry().list().is_empty());
        assert!(matches!(
            core.prompts().resolve("nope", true),
            Err(PromptError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_reads_config() {
        let temp = tempdir().unwrap();
        let mut config = CoreConfig::default();
        config.default_host_key_policy = HostKeyPolicy::Strict;
        config.known_hosts_path = Some(temp.path().join("pinned"));
        ConfigStorage::in_dir(temp.path()).save(&config).await.unwrap();

        let core = Core::open(temp.path(), Arc::new(NoopSink)).await.unwrap();
        assert_eq!(core.config().default_host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(core.trust().store().path(), temp.path().join("pinned").as_path());
    }

    #[tokio::test]
    async fn test_disconnect_closes_terminals() {
        let temp = tempdir().unwrap();
        let vault = Arc::new(MemoryVault::default());
        vault.set("cred:web", "hunter2").unwrap();
        let connector = Arc::new(FakeConnector::new(temp.path()));
        let sink = Arc::new(RecordingSink::default());

        let parts = CoreParts {
            config: CoreConfig::default(),
            known_hosts_path: temp.path().join("known_hosts"),
            profiles: Arc::new(MemoryProfiles::with([password_profile("web")])),
            vault,
            emitter: EventEmitter::new(sink),
        };
        let fake = connector.clone();
        let core = Core::assemble(parts, move |_| fake as Arc<dyn Connector>);

        let session = core.registry().connect("web").await.unwrap();
        core.terminals().open(&session, 80, 24).await.unwrap();
        assert_eq!(core.terminals().list().len(), 1);

        core.disconnect(&session).await.unwrap();
        assert!(core.terminals().list().is_empty());
        assert_eq!(connector.last_transport().close_count(), 1);

        core.shutdown().await;
    }
}
