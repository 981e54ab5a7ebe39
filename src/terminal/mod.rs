//! Remote terminals
//!
//! PTY shells over registry connections, streamed as `terminal:data` and
//! `terminal:exit` events.

mod hub;

pub use hub::{
    TerminalDataEvent, TerminalError, TerminalExitEvent, TerminalHub, TerminalInfo,
    STREAM_ERROR_CHUNK,
};
