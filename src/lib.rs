//! Shellmux - SSH remote access multiplexing core
//!
//! One authenticated SSH connection per profile, shared by interactive
//! terminals, SFTP transfers and tunneled stream dialers, with
//! trust-on-first-use host key verification.

pub mod config;
pub mod core;
pub mod events;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod terminal;
pub mod tunnel;

#[cfg(test)]
mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::core::{Core, CoreError, CoreParts};
pub use events::{BroadcastSink, CoreEvent, EventEmitter, EventSink, NoopSink};

/// Initialize logging
///
/// `RUST_LOG` overrides the default `info` filter. A no-op if the host
/// application already installed a subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
