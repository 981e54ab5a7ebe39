//! Event System
//!
//! Every component reports lifecycle changes through a single
//! `emit(event, payload)` capability. The embedding layer (a UI bridge, an
//! RPC facade, a test) supplies the sink; without one all emission is a
//! no-op and behavior is unchanged.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Host key approval requested (`HostKeyPrompt`)
pub const HOSTKEY_PROMPT: &str = "hostkey:prompt";
/// Connection lifecycle changed (`SessionStateEvent`)
pub const SESSION_STATE: &str = "session:state";
/// Terminal output chunk (`TerminalDataEvent`)
pub const TERMINAL_DATA: &str = "terminal:data";
/// Remote shell exited (`TerminalExitEvent`)
pub const TERMINAL_EXIT: &str = "terminal:exit";
/// Transfer progress tick (`TransferProgressEvent`)
pub const TRANSFER_PROGRESS: &str = "transfer:progress";
/// Transfer finished (`TransferDoneEvent`)
pub const TRANSFER_DONE: &str = "transfer:done";
/// Transfer failed or was canceled (`TransferErrorEvent`)
pub const TRANSFER_ERROR: &str = "transfer:error";

/// Destination for core notifications.
///
/// Implementations must not block; emission is fire-and-forget.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}

/// A named event as delivered by [`BroadcastSink`]
#[derive(Debug, Clone)]
pub struct CoreEvent {
    pub name: String,
    pub payload: Value,
}

/// Fans events out to any number of in-process subscribers.
///
/// Slow subscribers lag and lose the oldest events rather than
/// back-pressuring the emitting task.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<CoreEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &str, payload: Value) {
        // No subscribers is fine
        let _ = self.tx.send(CoreEvent {
            name: event.to_string(),
            payload,
        });
    }
}

/// Cloneable handle components use to emit typed payloads.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Option<Arc<dyn EventSink>>,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Create a no-op emitter (for testing or when events are not needed)
    pub fn noop() -> Self {
        Self { sink: None }
    }

    /// Serialize `payload` and hand it to the sink
    pub fn emit<T: Serialize>(&self, event: &str, payload: &T) {
        let Some(ref sink) = self.sink else {
            return;
        };
        match serde_json::to_value(payload) {
            Ok(value) => sink.emit(event, value),
            Err(e) => tracing::warn!("Failed to serialize {} event: {}", event, e),
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_noop_emitter() {
        let emitter = EventEmitter::noop();
        // Should not panic
        emitter.emit(SESSION_STATE, &json!({ "sessionId": "s1" }));
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        let emitter = EventEmitter::new(Arc::new(sink));

        emitter.emit(TERMINAL_EXIT, &json!({ "termId": "t1", "code": 0 }));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, TERMINAL_EXIT);
        assert_eq!(event.payload["termId"], "t1");
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let sink = BroadcastSink::new(1);
        sink.emit(TRANSFER_DONE, json!({}));
    }
}
