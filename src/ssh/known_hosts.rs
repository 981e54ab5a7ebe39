//! Known hosts management for SSH host key verification
//!
//! The trust store is an OpenSSH-style text file: one
//! `host[,host...] key-type base64-key` line per pinned identity. It is only
//! ever appended to during verification, so it stays human-appendable and
//! auditable. Entries are re-read on every verification so edits made
//! outside the process take effect immediately.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::host_key_prompt::HostKeyPromptBroker;

/// What to do with a host that has no pinned identity yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Ask a human through the prompt broker
    #[default]
    Ask,
    /// Reject unknown hosts
    Strict,
    /// Pin unknown hosts silently
    AcceptNew,
}

/// A remote host's public identity as presented during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    key_type: String,
    /// Base64 of the wire-encoded public key
    key_data: String,
}

impl HostIdentity {
    pub fn new(key_type: impl Into<String>, key_bytes: &[u8]) -> Self {
        Self {
            key_type: key_type.into(),
            key_data: BASE64.encode(key_bytes),
        }
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self::new(key.algorithm().as_str(), &key.public_key_bytes())
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// SHA256 fingerprint in OpenSSH notation
    pub fn fingerprint(&self) -> String {
        fingerprint_from_b64(&self.key_data)
    }
}

/// Compute fingerprint from stored base64 key
fn fingerprint_from_b64(stored_b64: &str) -> String {
    match BASE64.decode(stored_b64) {
        Ok(bytes) => {
            let hash = Sha256::digest(&bytes);
            format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
        }
        Err(_) => "unknown".to_string(),
    }
}

/// Result of looking a host up in the store
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Host is pinned to a different key (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// File-backed trust store
pub struct KnownHostsStore {
    path: PathBuf,
    /// Serializes check-then-append so concurrent first contacts pin once
    write_lock: Mutex<()>,
}

impl KnownHostsStore {
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lookup key for host:port (`host` on 22, `[host]:port` otherwise)
    pub fn make_key(host: &str, port: u16) -> String {
        let host = host.trim_start_matches('[').trim_end_matches(']').to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Normalize `host`, `host:port` or `[host]:port` into a lookup key
    pub fn normalize_label(label: &str) -> String {
        let label = label.trim();
        if let Some(rest) = label.strip_prefix('[') {
            if let Some((host, port)) = rest.split_once("]:") {
                let port = port.parse().unwrap_or(22);
                return Self::make_key(host, port);
            }
            return Self::make_key(rest.trim_end_matches(']'), 22);
        }
        // Bare IPv6 addresses carry several colons and no port
        match label.split_once(':') {
            Some((host, port)) if !port.contains(':') => match port.parse() {
                Ok(port) => Self::make_key(host, port),
                Err(_) => Self::make_key(label, 22),
            },
            _ => Self::make_key(label, 22),
        }
    }

    /// Create the store's directory (0700) and file (0600) if absent
    fn ensure_file(&self) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(0o700);
                }
                builder.create(parent)?;
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(&self.path)?;
        Ok(())
    }

    /// Load known_hosts file
    fn load(&self) -> Result<HashMap<String, Vec<HostKeyEntry>>, SshError> {
        self.ensure_file()?;

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            // Skip empty lines, comments and @cert-authority/@revoked markers
            if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
                continue;
            }

            // Parse: hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) are not supported
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize_label(hostname))
                    .or_default()
                    .push(entry.clone());
            }
        }

        Ok(hosts)
    }

    /// Compare `identity` against what is pinned for `label`
    pub fn lookup(
        &self,
        label: &str,
        identity: &HostIdentity,
    ) -> Result<HostKeyVerification, SshError> {
        let key = Self::normalize_label(label);
        let hosts = self.load()?;
        Ok(Self::check(&hosts, &key, identity))
    }

    fn check(
        hosts: &HashMap<String, Vec<HostKeyEntry>>,
        key: &str,
        identity: &HostIdentity,
    ) -> HostKeyVerification {
        let Some(entries) = hosts.get(key) else {
            return HostKeyVerification::Unknown {
                fingerprint: identity.fingerprint(),
            };
        };

        if entries
            .iter()
            .any(|e| e.key_type == identity.key_type && e.key_data == identity.key_data)
        {
            return HostKeyVerification::Verified;
        }

        // Any pinned key, of any type, that differs is a substitution
        let expected = entries
            .iter()
            .find(|e| e.key_type == identity.key_type)
            .or_else(|| entries.first())
            .map(|e| fingerprint_from_b64(&e.key_data))
            .unwrap_or_else(|| "unknown".to_string());

        HostKeyVerification::Changed {
            expected_fingerprint: expected,
            actual_fingerprint: identity.fingerprint(),
        }
    }

    /// Pin `identity` for `label` unless something already claims the host.
    ///
    /// The line is flushed to disk before returning.
    pub fn add_host(&self, label: &str, identity: &HostIdentity) -> Result<(), SshError> {
        let key = Self::normalize_label(label);
        let _guard = self.write_lock.lock();

        match Self::check(&self.load()?, &key, identity) {
            HostKeyVerification::Verified => return Ok(()),
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                return Err(SshError::HostKeyRejected(format!(
                    "host key for {} changed (expected {}, got {})",
                    key, expected_fingerprint, actual_fingerprint
                )));
            }
            HostKeyVerification::Unknown { .. } => {}
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{} {} {}", key, identity.key_type, identity.key_data)?;
        file.sync_all()?;

        info!(
            "Added host key for {} (type: {}) to {}",
            key,
            identity.key_type,
            self.path.display()
        );
        Ok(())
    }

    /// Remove a host from known_hosts (for deliberate key rotation)
    pub fn remove_host(&self, host: &str, port: u16) -> Result<(), SshError> {
        let remove_key = Self::make_key(host, port);
        let _guard = self.write_lock.lock();

        if !self.path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&self.path)?;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| {
                let Some(hostnames) = line.split_whitespace().next() else {
                    return true;
                };
                if hostnames.starts_with('#') {
                    return true;
                }
                !hostnames
                    .split(',')
                    .any(|h| Self::normalize_label(h) == remove_key)
            })
            .collect();

        let mut body = kept.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        let mut file = fs::File::create(&self.path)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;

        info!("Removed host key for {} from known_hosts", remove_key);
        Ok(())
    }
}

/// Trust-on-first-use verifier
///
/// Changed keys are rejected under every policy. Unknown keys follow the
/// caller's [`HostKeyPolicy`].
pub struct HostKeyVerifier {
    store: KnownHostsStore,
    prompt: Option<Arc<HostKeyPromptBroker>>,
}

impl HostKeyVerifier {
    pub fn new(store: KnownHostsStore, prompt: Option<Arc<HostKeyPromptBroker>>) -> Self {
        Self { store, prompt }
    }

    pub fn store(&self) -> &KnownHostsStore {
        &self.store
    }

    /// Verify `identity` for `label`, pinning it when the policy allows
    pub async fn verify(
        &self,
        label: &str,
        identity: &HostIdentity,
        policy: HostKeyPolicy,
    ) -> Result<(), SshError> {
        let host = KnownHostsStore::normalize_label(label);

        match self.store.lookup(&host, identity)? {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}", host);
                Ok(())
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}! Expected {}, got {}",
                    host, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "host key for {} changed (expected {}, got {}); remove the old entry from {} if the change is legitimate",
                    host,
                    expected_fingerprint,
                    actual_fingerprint,
                    self.store.path().display()
                )))
            }
            HostKeyVerification::Unknown { fingerprint } => match policy {
                HostKeyPolicy::Strict => {
                    warn!(
                        "Unknown host key for {} ({}), strict policy rejects",
                        host, fingerprint
                    );
                    Err(SshError::HostKeyRejected(format!(
                        "unknown host {} ({})",
                        host, fingerprint
                    )))
                }
                HostKeyPolicy::AcceptNew => {
                    info!("New host {}, pinning {}", host, fingerprint);
                    self.store.add_host(&host, identity)
                }
                HostKeyPolicy::Ask => {
                    let Some(prompt) = self.prompt.as_ref() else {
                        warn!("No prompt handler for unknown host {}", host);
                        return Err(SshError::HostKeyRejected(format!(
                            "unknown host {} and no prompt handler",
                            host
                        )));
                    };

                    let outcome = prompt.request_decision(&host, &fingerprint).await;
                    if outcome.is_allowed() {
                        info!("Host key for {} approved ({})", host, fingerprint);
                        self.store.add_host(&host, identity)
                    } else {
                        warn!("Host key for {} not approved: {:?}", host, outcome);
                        Err(SshError::HostKeyRejected(format!(
                            "host key for {} was not approved",
                            host
                        )))
                    }
                }
            },
        }
    }
}
