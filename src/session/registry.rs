//! Connection Registry
//!
//! Sole owner of authenticated transports. One entry per session id, at most
//! one `connected` entry per profile. Terminals, transfers and tunnels
//! borrow connections through [`ConnectionRegistry::fetch_connection`].
//!
//! # Lifecycle
//!
//! ```text
//! connect ──▶ Connecting ──dial ok──▶ Connected ──disconnect──▶ (removed)
//!                 │                       │
//!             dial error            keep-alive error
//!                 ▼                       ▼
//!             (removed)             Disconnected (kept for status,
//!                                   dropped from by-profile lookup)
//! ```
//!
//! Each entry owns its keep-alive task handle and stop token. The transport
//! is closed exactly once, by whichever of disconnect / keep-alive failure
//! gets there first.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use russh::keys::{decode_secret_key, PrivateKey};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{ConnectionState, ConnectionStatus, SessionInfo, SessionStateEvent};
use crate::config::keychain::{passphrase_key, password_key, SecretVault, VaultError};
use crate::config::profiles::{AuthType, Profile, ProfileError, ProfileSource};
use crate::events::{EventEmitter, SESSION_STATE};
use crate::ssh::transport::{ConnectTarget, Connector, Credentials, Transport};
use crate::ssh::{HostKeyPolicy, SshError};

/// Default keep-alive period
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session not connected: {0}")]
    NotConnected(String),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("{0}")]
    Credentials(String),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, RegistryError::NotConnected(_))
    }
}

impl serde::Serialize for RegistryError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Transport plus its closed flag, under one lock so close happens once
#[derive(Default)]
struct TransportSlot {
    transport: Option<Arc<dyn Transport>>,
    closed: bool,
}

/// One registry entry
struct Connection {
    id: String,
    profile_id: String,
    created_at: DateTime<Utc>,
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<String>>,
    slot: Mutex<TransportSlot>,
    keepalive_stop: CancellationToken,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn new(id: String, profile_id: String) -> Self {
        Self {
            id,
            profile_id,
            created_at: Utc::now(),
            state: RwLock::new(ConnectionState::Connecting),
            last_error: RwLock::new(None),
            slot: Mutex::new(TransportSlot::default()),
            keepalive_stop: CancellationToken::new(),
            keepalive_task: Mutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.write(), state)
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.write() = error;
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.slot.lock().transport.clone()
    }

    /// Store the dialed transport. Returns it back if the entry was torn
    /// down while dialing, so the caller can close it.
    fn install(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let mut slot = self.slot.lock();
        if slot.closed {
            return Some(transport);
        }
        slot.transport = Some(transport);
        None
    }

    /// Claim the right to close the transport. Only the first caller gets it.
    fn take_for_close(&self) -> Option<Arc<dyn Transport>> {
        let mut slot = self.slot.lock();
        if slot.closed {
            return None;
        }
        slot.closed = true;
        slot.transport.take()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            profile_id: self.profile_id.clone(),
            state: self.state(),
            last_error: self.last_error.read().clone(),
            created_at: self.created_at,
        }
    }
}

pub struct ConnectionRegistry {
    sessions: DashMap<String, Arc<Connection>>,
    by_profile: DashMap<String, String>,
    /// Serializes connect attempts per profile
    connect_gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    profiles: Arc<dyn ProfileSource>,
    vault: Arc<dyn SecretVault>,
    connector: Arc<dyn Connector>,
    emitter: EventEmitter,
    default_policy: HostKeyPolicy,
    keepalive_interval: Duration,
}

impl ConnectionRegistry {
    pub fn new(
        profiles: Arc<dyn ProfileSource>,
        vault: Arc<dyn SecretVault>,
        connector: Arc<dyn Connector>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            by_profile: DashMap::new(),
            connect_gates: DashMap::new(),
            profiles,
            vault,
            connector,
            emitter,
            default_policy: HostKeyPolicy::Ask,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }

    /// Policy for profiles that don't set one
    pub fn with_default_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Connected session for `profile_id`, if any
    pub fn session_for_profile(&self, profile_id: &str) -> Option<String> {
        let session_id = self.by_profile.get(profile_id)?.value().clone();
        let conn = self.sessions.get(&session_id)?.value().clone();
        (conn.state() == ConnectionState::Connected).then_some(session_id)
    }

    /// Connect `profile_id`, or return its existing connected session
    pub async fn connect(self: &Arc<Self>, profile_id: &str) -> Result<String, RegistryError> {
        if let Some(existing) = self.session_for_profile(profile_id) {
            debug!("Profile {} already connected as {}", profile_id, existing);
            return Ok(existing);
        }

        let gate = self
            .connect_gates
            .entry(profile_id.to_string())
            .or_default()
            .clone();
        let _gate = gate.lock().await;

        // Another caller may have finished while we waited
        if let Some(existing) = self.session_for_profile(profile_id) {
            return Ok(existing);
        }

        let profile = self.profiles.get(profile_id).await?;
        let credentials = self.resolve_credentials(&profile).await?;
        let target = ConnectTarget {
            host: profile.host.clone(),
            port: profile.effective_port(),
            username: profile.username.clone(),
            credentials,
            host_key_policy: profile.known_hosts_policy.unwrap_or(self.default_policy),
        };

        let session_id = Uuid::new_v4().to_string();
        let conn = Arc::new(Connection::new(session_id.clone(), profile_id.to_string()));
        self.sessions.insert(session_id.clone(), conn.clone());
        self.emit_state(&conn);

        info!(
            "Connecting session {} for profile {} ({}@{}:{})",
            session_id, profile_id, target.username, target.host, target.port
        );

        let transport = match self.connector.connect(target).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Connect failed for profile {}: {}", profile_id, e);
                self.sessions.remove(&session_id);
                conn.take_for_close();
                conn.set_error(Some(e.to_string()));
                conn.set_state(ConnectionState::Disconnected);
                self.emit_state(&conn);
                return Err(e.into());
            }
        };

        if let Some(orphan) = conn.install(transport) {
            // Disconnected while dialing
            orphan.close().await;
            return Err(RegistryError::NotConnected(session_id));
        }

        conn.set_state(ConnectionState::Connected);
        self.by_profile
            .insert(profile_id.to_string(), session_id.clone());
        self.emit_state(&conn);
        self.start_keepalive(&conn);

        info!("Session {} connected", session_id);
        Ok(session_id)
    }

    async fn resolve_credentials(&self, profile: &Profile) -> Result<Credentials, RegistryError> {
        match profile.auth_type {
            AuthType::Password => {
                if !profile.use_keyring {
                    return Err(RegistryError::Credentials(
                        "password not found in keyring".to_string(),
                    ));
                }
                match self.vault.get(&password_key(&profile.id)) {
                    Ok(password) => Ok(Credentials::Password(password)),
                    Err(e) if e.is_not_found() => Err(RegistryError::Credentials(
                        "password not found in keyring".to_string(),
                    )),
                    Err(e) => Err(e.into()),
                }
            }
            AuthType::PrivateKey => {
                let path = profile.private_key_path.as_ref().ok_or_else(|| {
                    RegistryError::Credentials("private key path is required".to_string())
                })?;
                let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
                    RegistryError::Credentials(format!(
                        "failed to read private key {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let key = self.parse_private_key(&profile.id, &pem)?;
                Ok(Credentials::PrivateKey(Arc::new(key)))
            }
        }
    }

    /// Unencrypted parse first, then retry with the stored passphrase
    fn parse_private_key(&self, profile_id: &str, pem: &str) -> Result<PrivateKey, RegistryError> {
        let first_err = match decode_secret_key(pem, None) {
            Ok(key) => return Ok(key),
            Err(e) => e,
        };

        match self.vault.get(&passphrase_key(profile_id)) {
            Ok(passphrase) => {
                decode_secret_key(pem, Some(&passphrase)).map_err(|e| SshError::from(e).into())
            }
            Err(e) if e.is_not_found() => Err(SshError::from(first_err).into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Holds the registry weakly: once the registry is dropped the task
    /// closes its transport and stops.
    fn start_keepalive(self: &Arc<Self>, conn: &Arc<Connection>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let task_conn = conn.clone();
        let stop = conn.keepalive_stop.clone();
        let period = self.keepalive_interval;

        let task = tokio::spawn(async move {
            let conn = task_conn;
            debug!(
                "Keep-alive started for session {} (interval={}s)",
                conn.id,
                period.as_secs()
            );
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if registry.strong_count() == 0 {
                    debug!("Registry dropped, closing session {}", conn.id);
                    if let Some(transport) = conn.take_for_close() {
                        transport.close().await;
                    }
                    break;
                }
                let Some(transport) = conn.transport() else {
                    break;
                };
                let result = tokio::select! {
                    _ = stop.cancelled() => break,
                    result = transport.keepalive() => result,
                };

                if let Err(e) = result {
                    match registry.upgrade() {
                        Some(registry) => registry.on_keepalive_failure(&conn, e).await,
                        None => {
                            if let Some(transport) = conn.take_for_close() {
                                transport.close().await;
                            }
                        }
                    }
                    break;
                }
            }

            debug!("Keep-alive stopped for session {}", conn.id);
        });

        *conn.keepalive_task.lock() = Some(task);
    }

    async fn on_keepalive_failure(&self, conn: &Arc<Connection>, err: SshError) {
        warn!("Keep-alive failed for session {}: {}", conn.id, err);

        conn.set_error(Some(err.to_string()));
        if conn.set_state(ConnectionState::Disconnected) == ConnectionState::Disconnected {
            return;
        }
        self.by_profile
            .remove_if(&conn.profile_id, |_, session_id| session_id == &conn.id);

        if let Some(transport) = conn.take_for_close() {
            transport.close().await;
        }
        self.emit_state(conn);
    }

    /// Stop keep-alive, close the transport and forget the session
    pub async fn disconnect(&self, session_id: &str) -> Result<(), RegistryError> {
        let (_, conn) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        self.by_profile
            .remove_if(&conn.profile_id, |_, id| id == session_id);

        conn.keepalive_stop.cancel();
        let task = conn.keepalive_task.lock().take();
        if let Some(task) = task {
            // Returns promptly: the task watches the stop token
            let _ = task.await;
        }

        if let Some(transport) = conn.take_for_close() {
            transport.close().await;
        }

        conn.set_state(ConnectionState::Disconnected);
        self.emit_state(&conn);

        info!("Session {} disconnected", session_id);
        Ok(())
    }

    /// Disconnect every session
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.disconnect(&id).await;
        }
    }

    pub fn status(&self, session_id: &str) -> Result<ConnectionStatus, RegistryError> {
        let conn = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        let last_error = conn.last_error.read().clone();
        Ok(ConnectionStatus {
            state: conn.state(),
            last_error,
        })
    }

    /// Live transport for `session_id`
    pub fn fetch_connection(&self, session_id: &str) -> Result<Arc<dyn Transport>, RegistryError> {
        let conn = self
            .sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        if conn.state() != ConnectionState::Connected {
            return Err(RegistryError::NotConnected(session_id.to_string()));
        }
        conn.transport()
            .ok_or_else(|| RegistryError::NotConnected(session_id.to_string()))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|e| e.value().info()).collect()
    }

    fn emit_state(&self, conn: &Connection) {
        self.emitter.emit(
            SESSION_STATE,
            &SessionStateEvent {
                session_id: conn.id.clone(),
                profile_id: conn.profile_id.clone(),
                state: conn.state(),
                error: conn.last_error.read().clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{password_profile, FakeConnector, MemoryProfiles, MemoryVault, RecordingSink};
    use std::sync::atomic::Ordering;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _temp: TempDir,
        connector: Arc<FakeConnector>,
        sink: Arc<RecordingSink>,
        vault: Arc<MemoryVault>,
        registry: Arc<ConnectionRegistry>,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let connector = Arc::new(FakeConnector::new(temp.path()));
        let sink = Arc::new(RecordingSink::default());
        let vault = Arc::new(MemoryVault::default());
        vault.set("cred:web", "hunter2").unwrap();
        vault.set("cred:db", "s3cret").unwrap();

        let mut nokey = password_profile("nokey");
        nokey.use_keyring = false;
        let profiles = Arc::new(MemoryProfiles::with([
            password_profile("web"),
            password_profile("db"),
            password_profile("nopass"),
            nokey,
        ]));

        let registry = Arc::new(ConnectionRegistry::new(
            profiles,
            vault.clone(),
            connector.clone(),
            EventEmitter::new(sink.clone()),
        ));
        Fixture {
            _temp: temp,
            connector,
            sink,
            vault,
            registry,
        }
    }

    #[tokio::test]
    async fn test_connect_twice_reuses_session() {
        let f = fixture();

        let first = f.registry.connect("web").await.unwrap();
        let second = f.registry.connect("web").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.connector.dial_count(), 1);
        assert_eq!(
            f.registry.status(&first).unwrap().state,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_concurrent_connects_dial_once() {
        let f = fixture();

        let (a, b) = tokio::join!(f.registry.connect("web"), f.registry.connect("web"));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(f.connector.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_credentials_reach_connector() {
        let f = fixture();
        f.registry.connect("db").await.unwrap();

        let targets = f.connector.targets.lock();
        let target = targets.last().unwrap();
        assert_eq!(target.host, "db.example");
        assert_eq!(target.port, 22);
        assert_eq!(target.host_key_policy, HostKeyPolicy::Ask);
        assert!(matches!(&target.credentials, Credentials::Password(p) if p == "s3cret"));
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect_creates_new_session() {
        let f = fixture();

        let first = f.registry.connect("web").await.unwrap();
        let transport = f.connector.last_transport();
        f.registry.disconnect(&first).await.unwrap();

        assert_eq!(transport.close_count(), 1);
        assert!(f.registry.status(&first).unwrap_err().is_not_found());
        assert!(f.registry.session_for_profile("web").is_none());

        let second = f.registry.connect("web").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(f.connector.dial_count(), 2);

        let states: Vec<SessionStateEvent> = f.sink.payloads(SESSION_STATE);
        let last_for_first = states.iter().rfind(|e| e.session_id == first).unwrap();
        assert_eq!(last_for_first.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_session() {
        let f = fixture();
        let err = f.registry.disconnect("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fetch_connection() {
        let f = fixture();
        assert!(f.registry.fetch_connection("missing").err().unwrap().is_not_found());

        let id = f.registry.connect("web").await.unwrap();
        assert!(f.registry.fetch_connection(&id).is_ok());
    }

    #[tokio::test]
    async fn test_password_requires_keyring() {
        let f = fixture();

        let err = f.registry.connect("nokey").await.unwrap_err();
        assert_eq!(err.to_string(), "password not found in keyring");

        let err = f.registry.connect("nopass").await.unwrap_err();
        assert_eq!(err.to_string(), "password not found in keyring");

        assert_eq!(f.connector.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_profile() {
        let f = fixture();
        let err = f.registry.connect("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::Profile(ProfileError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        let f = fixture();
        *f.connector.fail_with.lock() =
            Some(SshError::HostKeyRejected("unknown host web.example".into()));

        let err = f.registry.connect("web").await.unwrap_err();
        assert!(matches!(err, RegistryError::Ssh(ref e) if e.is_trust_rejection()));
        assert!(f.registry.list().is_empty());

        let states: Vec<SessionStateEvent> = f.sink.payloads(SESSION_STATE);
        let last = states.last().unwrap();
        assert_eq!(last.state, ConnectionState::Disconnected);
        assert!(last.error.as_deref().unwrap().contains("unknown host"));
    }

    #[tokio::test]
    async fn test_private_key_without_path() {
        let f = fixture();
        let mut profile = password_profile("keyed");
        profile.auth_type = AuthType::PrivateKey;
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(MemoryProfiles::with([profile])),
            f.vault.clone(),
            f.connector.clone(),
            EventEmitter::noop(),
        ));

        let err = registry.connect("keyed").await.unwrap_err();
        assert!(matches!(err, RegistryError::Credentials(_)));
    }

    #[tokio::test]
    async fn test_unparsable_key_without_passphrase() {
        let temp = tempdir().unwrap();
        let key_path = temp.path().join("id_test");
        std::fs::write(&key_path, "not a key").unwrap();

        let mut profile = password_profile("keyed");
        profile.auth_type = AuthType::PrivateKey;
        profile.private_key_path = Some(key_path);

        let connector = Arc::new(FakeConnector::new(temp.path()));
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(MemoryProfiles::with([profile])),
            Arc::new(MemoryVault::default()),
            connector.clone(),
            EventEmitter::noop(),
        ));

        let err = registry.connect("keyed").await.unwrap_err();
        assert!(matches!(err, RegistryError::Ssh(SshError::KeyError(_))));
        assert_eq!(connector.dial_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_failure_marks_disconnected_once() {
        let f = fixture();
        let id = f.registry.connect("web").await.unwrap();
        let transport = f.connector.last_transport();

        // Healthy ticks
        tokio::time::sleep(DEFAULT_KEEPALIVE_INTERVAL * 2 + Duration::from_secs(1)).await;
        assert!(transport.keepalives.load(Ordering::SeqCst) >= 2);
        assert_eq!(f.registry.status(&id).unwrap().state, ConnectionState::Connected);

        transport.keepalive_fails.store(true, Ordering::SeqCst);
        tokio::time::sleep(DEFAULT_KEEPALIVE_INTERVAL).await;

        let disconnected: Vec<SessionStateEvent> = f.sink.payloads(SESSION_STATE);
        assert_eq!(
            disconnected
                .iter()
                .filter(|e| e.session_id == id && e.state == ConnectionState::Disconnected)
                .count(),
            1
        );

        let status = f.registry.status(&id).unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.last_error.is_some());
        assert!(f.registry.fetch_connection(&id).err().unwrap().is_not_connected());
        assert_eq!(transport.close_count(), 1);

        // Never retried
        let probes = transport.keepalives.load(Ordering::SeqCst);
        tokio::time::sleep(DEFAULT_KEEPALIVE_INTERVAL * 3).await;
        assert_eq!(transport.keepalives.load(Ordering::SeqCst), probes);

        // Profile is free for a fresh session
        let fresh = f.registry.connect("web").await.unwrap();
        assert_ne!(fresh, id);

        // Cleaning up the dead entry does not close its transport again
        f.registry.disconnect(&id).await.unwrap();
        assert_eq!(transport.close_count(), 1);
        assert_eq!(f.registry.session_for_profile("web"), Some(fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_registry_stops_keepalive() {
        let f = fixture();
        f.registry.connect("web").await.unwrap();
        let transport = f.connector.last_transport();

        drop(f.registry);
        tokio::time::sleep(DEFAULT_KEEPALIVE_INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(transport.keepalives.load(Ordering::SeqCst), 0);
        assert_eq!(transport.close_count(), 1);

        tokio::time::sleep(DEFAULT_KEEPALIVE_INTERVAL * 3).await;
        assert_eq!(transport.keepalives.load(Ordering::SeqCst), 0);
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let f = fixture();
        f.registry.connect("web").await.unwrap();
        f.registry.connect("db").await.unwrap();

        f.registry.disconnect_all().await;
        assert!(f.registry.list().is_empty());
    }
}
