//! Session Management Module
//!
//! Owns authenticated SSH connections, keyed by session id:
//! - At most one live connection per profile
//! - Per-connection keep-alive with automatic teardown
//! - `session:state` events for every lifecycle change

mod registry;
pub mod types;

pub use registry::{ConnectionRegistry, RegistryError, DEFAULT_KEEPALIVE_INTERVAL};
pub use types::{ConnectionState, ConnectionStatus, SessionInfo, SessionStateEvent};
