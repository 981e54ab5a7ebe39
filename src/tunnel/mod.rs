//! Stream dialer over SSH sessions

mod dialer;

pub use dialer::{parse_address, DialFn, TunnelDialer, TunnelError, SSH_TARGET_PREFIX};
