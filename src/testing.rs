//! In-memory fakes shared by the unit tests

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::config::keychain::{SecretVault, VaultError};
use crate::config::profiles::{AuthType, Profile, ProfileError, ProfileSource};
use crate::events::{EventEmitter, EventSink};
use crate::session::ConnectionRegistry;
use crate::ssh::transport::{
    ConnectTarget, Connector, PtySize, RemoteDirEntry, RemoteFs, RemoteMetadata, RemoteReader,
    RemoteWriter, ShellChannel, ShellControl, ShellExit, Transport, TunnelStream,
};
use crate::ssh::SshError;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Reader that plays back a script of chunks and I/O errors, then EOF
pub struct ScriptedReader {
    steps: VecDeque<io::Result<Vec<u8>>>,
}

impl ScriptedReader {
    pub fn new(steps: impl IntoIterator<Item = io::Result<Vec<u8>>>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
        }
    }
}

impl AsyncRead for ScriptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.steps.pop_front() {
            Some(Ok(chunk)) => {
                buf.put_slice(&chunk);
                Poll::Ready(Ok(()))
            }
            Some(Err(e)) => Poll::Ready(Err(e)),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Sink that keeps every event for inspection
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, Value)>>,
    notify: Notify,
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &str, payload: Value) {
        self.events.lock().push((event.to_string(), payload));
        self.notify.notify_waiters();
    }
}

impl RecordingSink {
    pub fn events(&self, name: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn payloads<T: DeserializeOwned>(&self, name: &str) -> Vec<T> {
        self.events(name)
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect()
    }

    /// Wait until at least `count` events named `name` were emitted
    pub async fn wait_for_payloads<T: DeserializeOwned>(&self, name: &str, count: usize) -> Vec<T> {
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let notified = self.notify.notified();
                let found = self.events(name);
                if found.len() >= count {
                    return found
                        .into_iter()
                        .map(|v| serde_json::from_value(v).unwrap())
                        .collect();
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {} x{}", name, count))
    }

    pub async fn wait_for_payload<T: DeserializeOwned>(&self, name: &str) -> T {
        self.wait_for_payloads(name, 1).await.remove(0)
    }

    /// Wait for the first event named `name` matching `pred`
    pub async fn wait_for(&self, name: &str, pred: impl Fn(&Value) -> bool) -> Value {
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let notified = self.notify.notified();
                if let Some(v) = self.events(name).into_iter().find(|v| pred(v)) {
                    return v;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", name))
    }
}

#[derive(Default)]
pub struct MemoryVault {
    secrets: Mutex<HashMap<String, String>>,
}

impl SecretVault for MemoryVault {
    fn get(&self, key: &str) -> Result<String, VaultError> {
        self.secrets
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(key.to_string()))
    }

    fn set(&self, key: &str, secret: &str) -> Result<(), VaultError> {
        self.secrets.lock().insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), VaultError> {
        self.secrets.lock().remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryProfiles {
    profiles: Mutex<HashMap<String, Profile>>,
}

impl MemoryProfiles {
    pub fn with(profiles: impl IntoIterator<Item = Profile>) -> Self {
        let store = Self::default();
        for p in profiles {
            store.profiles.lock().insert(p.id.clone(), p);
        }
        store
    }
}

#[async_trait]
impl ProfileSource for MemoryProfiles {
    async fn get(&self, id: &str) -> Result<Profile, ProfileError> {
        self.profiles
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<Profile>, ProfileError> {
        Ok(self.profiles.lock().values().cloned().collect())
    }

    async fn save(&self, profile: Profile) -> Result<(), ProfileError> {
        self.profiles.lock().insert(profile.id.clone(), profile);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), ProfileError> {
        self.profiles
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))
    }
}

pub fn password_profile(id: &str) -> Profile {
    Profile {
        id: id.to_string(),
        name: id.to_string(),
        group: String::new(),
        host: format!("{}.example", id),
        port: 22,
        username: "ops".to_string(),
        auth_type: AuthType::Password,
        private_key_path: None,
        use_keyring: true,
        known_hosts_policy: None,
    }
}

/// Remote end of a fake shell
pub struct RemoteShell {
    pub size: PtySize,
    /// Bytes the client wrote to stdin
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    pub control: mpsc::Receiver<ShellControl>,
    pub exit: oneshot::Sender<ShellExit>,
}

/// `RemoteFs` over a local directory; remote paths are relative to `root`
pub struct LocalFs {
    root: PathBuf,
    stalled: Mutex<HashMap<String, (DuplexStream, u64)>>,
}

impl LocalFs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            stalled: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Serve `path` from `reader` (reporting `size`) instead of the disk
    pub fn stall(&self, path: &str, reader: DuplexStream, size: u64) {
        self.stalled.lock().insert(path.to_string(), (reader, size));
    }
}

fn local_metadata(meta: &std::fs::Metadata) -> RemoteMetadata {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    RemoteMetadata {
        size: meta.len(),
        is_dir: meta.is_dir(),
        permissions: 0o644,
        mtime,
    }
}

#[async_trait]
impl RemoteFs for LocalFs {
    async fn open_read(&self, path: &str) -> Result<RemoteReader, SshError> {
        let stalled = self.stalled.lock().remove(path);
        if let Some((reader, _)) = stalled {
            return Ok(Box::new(reader));
        }
        Ok(Box::new(tokio::fs::File::open(self.resolve(path)).await?))
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SshError> {
        Ok(Box::new(tokio::fs::File::create(self.resolve(path)).await?))
    }

    async fn metadata(&self, path: &str) -> Result<RemoteMetadata, SshError> {
        let stalled = self.stalled.lock().get(path).map(|(_, size)| *size);
        if let Some(size) = stalled {
            return Ok(RemoteMetadata {
                size,
                ..Default::default()
            });
        }
        Ok(local_metadata(&tokio::fs::metadata(self.resolve(path)).await?))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, SshError> {
        let mut entries = vec![
            RemoteDirEntry {
                name: ".".to_string(),
                metadata: RemoteMetadata {
                    is_dir: true,
                    ..Default::default()
                },
            },
            RemoteDirEntry {
                name: "..".to_string(),
                metadata: RemoteMetadata {
                    is_dir: true,
                    ..Default::default()
                },
            },
        ];
        let mut dir = tokio::fs::read_dir(self.resolve(path)).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(RemoteDirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                metadata: local_metadata(&entry.metadata().await?),
            });
        }
        Ok(entries)
    }

    async fn create_dir(&self, path: &str) -> Result<(), SshError> {
        Ok(tokio::fs::create_dir(self.resolve(path)).await?)
    }

    async fn remove_file(&self, path: &str) -> Result<(), SshError> {
        Ok(tokio::fs::remove_file(self.resolve(path)).await?)
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SshError> {
        // Non-recursive, like the real protocol
        Ok(tokio::fs::remove_dir(self.resolve(path)).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SshError> {
        Ok(tokio::fs::rename(self.resolve(from), self.resolve(to)).await?)
    }
}

/// Scriptable transport
pub struct FakeTransport {
    pub fs: Arc<LocalFs>,
    pub keepalive_fails: AtomicBool,
    pub keepalives: AtomicUsize,
    pub closes: AtomicUsize,
    shells: Mutex<Vec<RemoteShell>>,
    shell_opened: Notify,
    pub tunnels: Mutex<Vec<(String, u16, DuplexStream)>>,
}

impl FakeTransport {
    pub fn new(fs_root: &Path) -> Self {
        Self {
            fs: Arc::new(LocalFs::new(fs_root)),
            keepalive_fails: AtomicBool::new(false),
            keepalives: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            shells: Mutex::new(Vec::new()),
            shell_opened: Notify::new(),
            tunnels: Mutex::new(Vec::new()),
        }
    }

    /// Remote end of the next shell the client opens
    pub async fn take_shell(&self) -> RemoteShell {
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let notified = self.shell_opened.notified();
                let shell = self.shells.lock().pop();
                if let Some(shell) = shell {
                    return shell;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for a shell")
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_shell(&self, size: PtySize) -> Result<ShellChannel, SshError> {
        if self.closes.load(Ordering::SeqCst) > 0 {
            return Err(SshError::Disconnected);
        }
        let (stdin, remote_stdin) = tokio::io::duplex(4096);
        let (remote_stdout, stdout) = tokio::io::duplex(4096);
        let (remote_stderr, stderr) = tokio::io::duplex(4096);
        let (control, control_rx) = mpsc::channel(8);
        let (exit_tx, exit) = oneshot::channel();

        self.shells.lock().push(RemoteShell {
            size,
            stdin: remote_stdin,
            stdout: remote_stdout,
            stderr: remote_stderr,
            control: control_rx,
            exit: exit_tx,
        });
        self.shell_opened.notify_waiters();

        Ok(ShellChannel {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            control,
            exit,
        })
    }

    async fn open_file_system(&self) -> Result<Arc<dyn RemoteFs>, SshError> {
        Ok(self.fs.clone())
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<TunnelStream, SshError> {
        let (local, remote) = tokio::io::duplex(4096);
        self.tunnels.lock().push((host.to_string(), port, remote));
        Ok(Box::new(local))
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        if self.keepalive_fails.load(Ordering::SeqCst) {
            Err(SshError::Disconnected)
        } else {
            Ok(())
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out [`FakeTransport`]s
pub struct FakeConnector {
    fs_root: PathBuf,
    pub dials: AtomicUsize,
    pub fail_with: Mutex<Option<SshError>>,
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
    pub targets: Mutex<Vec<ConnectTarget>>,
}

impl FakeConnector {
    pub fn new(fs_root: &Path) -> Self {
        Self {
            fs_root: fs_root.to_path_buf(),
            dials: AtomicUsize::new(0),
            fail_with: Mutex::new(None),
            transports: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn last_transport(&self) -> Arc<FakeTransport> {
        self.transports.lock().last().cloned().expect("no transport dialed")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: ConnectTarget) -> Result<Arc<dyn Transport>, SshError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to interleave
        tokio::task::yield_now().await;

        self.targets.lock().push(target);
        if let Some(err) = self.fail_with.lock().take() {
            return Err(err);
        }
        let transport = Arc::new(FakeTransport::new(&self.fs_root));
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// A registry with one connected `password_profile("web")` session
pub struct Harness {
    pub temp: TempDir,
    pub connector: Arc<FakeConnector>,
    pub sink: Arc<RecordingSink>,
    pub registry: Arc<ConnectionRegistry>,
    pub session_id: String,
}

impl Harness {
    pub async fn connected() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let connector = Arc::new(FakeConnector::new(temp.path()));
        let sink = Arc::new(RecordingSink::default());
        let vault = Arc::new(MemoryVault::default());
        vault.set("cred:web", "hunter2").unwrap();

        let registry = Arc::new(ConnectionRegistry::new(
            Arc::new(MemoryProfiles::with([password_profile("web")])),
            vault,
            connector.clone(),
            EventEmitter::new(sink.clone()),
        ));
        let session_id = registry.connect("web").await.unwrap();

        Self {
            temp,
            connector,
            sink,
            registry,
            session_id,
        }
    }

    pub fn transport(&self) -> Arc<FakeTransport> {
        self.connector.last_transport()
    }

    pub fn emitter(&self) -> EventEmitter {
        EventEmitter::new(self.sink.clone())
    }

    /// Path inside the fake remote filesystem root
    pub fn remote_root(&self) -> &Path {
        self.temp.path()
    }
}
