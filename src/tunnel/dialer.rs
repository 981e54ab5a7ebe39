//! Tunnel Dialer
//!
//! Named dial targets that open `direct-tcpip` channels over an already
//! authenticated session. A database driver (or any client that accepts a
//! custom dialer) asks for `dial(name, "host:port")` and gets a byte stream
//! instead of a raw socket.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tracing::{debug, info};

use crate::session::{ConnectionRegistry, RegistryError};
use crate::ssh::transport::TunnelStream;
use crate::ssh::SshError;

/// Prefix for targets registered by [`TunnelDialer::attach`]
pub const SSH_TARGET_PREFIX: &str = "ssh+";

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Dial target not registered: {0}")]
    NotRegistered(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Dial target {0} has no connected session")]
    NotConnected(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Opens a stream to `(host, port)`
pub type DialFn =
    Arc<dyn Fn(String, u16) -> BoxFuture<'static, Result<TunnelStream, TunnelError>> + Send + Sync>;

/// Split `host:port` or `[v6]:port`
pub fn parse_address(address: &str) -> Result<(String, u16), TunnelError> {
    let invalid = || TunnelError::InvalidAddress(address.to_string());

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, port)
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        // Bare IPv6 needs brackets
        if host.contains(':') {
            return Err(invalid());
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

pub struct TunnelDialer {
    registry: Arc<ConnectionRegistry>,
    routes: DashMap<String, DialFn>,
}

impl TunnelDialer {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            routes: DashMap::new(),
        }
    }

    /// Register `name`. Returns false, keeping the existing route, if the
    /// name is already taken.
    pub fn register(&self, name: &str, dial: DialFn) -> bool {
        match self.routes.entry(name.to_string()) {
            Entry::Occupied(_) => {
                debug!("Dial target {} already registered", name);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(dial);
                info!("Registered dial target {}", name);
                true
            }
        }
    }

    /// Route `name` through whichever session is connected for `profile_id`
    /// at dial time
    pub fn register_profile(&self, name: &str, profile_id: &str) -> bool {
        let registry = self.registry.clone();
        let profile_id = profile_id.to_string();
        let target = name.to_string();

        let dial: DialFn = Arc::new(move |host: String, port: u16| {
            let registry = registry.clone();
            let profile_id = profile_id.clone();
            let target = target.clone();
            Box::pin(async move {
                let session_id = registry
                    .session_for_profile(&profile_id)
                    .ok_or(TunnelError::NotConnected(target))?;
                let transport = registry.fetch_connection(&session_id)?;
                Ok(transport.open_direct_tcpip(&host, port).await?)
            })
        });
        self.register(name, dial)
    }

    /// Connect (or reuse) the profile's session and register
    /// `ssh+<name>` for it. Returns the target name.
    pub async fn attach(&self, name: &str, profile_id: &str) -> Result<String, TunnelError> {
        self.registry.connect(profile_id).await?;
        let target = format!("{}{}", SSH_TARGET_PREFIX, name);
        self.register_profile(&target, profile_id);
        Ok(target)
    }

    /// Drop the `ssh+<name>` target
    pub fn detach(&self, name: &str) -> bool {
        self.unregister(&format!("{}{}", SSH_TARGET_PREFIX, name))
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.routes.remove(name).is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Open a stream to `address` through target `name`
    pub async fn dial(&self, name: &str, address: &str) -> Result<TunnelStream, TunnelError> {
        let dial = self
            .routes
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| TunnelError::NotRegistered(name.to_string()))?;
        let (host, port) = parse_address(address)?;

        debug!("Dialing {}:{} via {}", host, port, name);
        dial(host, port).await
    }
}
