//! Host Key Prompt Broker
//!
//! Suspends a verification until a human approves or denies an unknown host
//! key through a side channel, or until the prompt times out.
//!
//! ```text
//! Verifier                  Broker                     UI
//!    │── request_decision ──▶│                          │
//!    │                       │── hostkey:prompt ───────▶│
//!    │                       │◀──────── resolve(id) ────│
//!    │◀──── Allowed/Denied ──│                          │
//! ```
//!
//! The pending slot is removed by whichever side gets there first: a
//! `resolve` call or the waiter ending (answered, timed out or dropped).
//! The loser finds no slot and is a no-op.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventEmitter, HOSTKEY_PROMPT};

/// Default time a human has to answer
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Event payload: an unknown host key awaits approval
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyPrompt {
    /// Routes the answer back through [`HostKeyPromptBroker::resolve`]
    pub id: String,
    pub host: String,
    pub fingerprint: String,
}

/// How a prompt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    Allowed,
    Denied,
    TimedOut,
}

impl PromptOutcome {
    pub fn is_allowed(self) -> bool {
        self == PromptOutcome::Allowed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// Already resolved, timed out, or never issued
    #[error("Host key prompt not found: {0}")]
    NotFound(String),
}

impl serde::Serialize for PromptError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Removes a prompt's slot when its waiter goes away, however it ends
struct PendingSlot<'a> {
    pending: &'a Mutex<HashMap<String, oneshot::Sender<bool>>>,
    id: String,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.pending.lock().remove(&self.id).is_some() {
            debug!("Host key prompt {} abandoned", self.id);
        }
    }
}

/// Correlates prompt ids with suspended verifications
pub struct HostKeyPromptBroker {
    emitter: EventEmitter,
    timeout: Duration,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl HostKeyPromptBroker {
    pub fn new(emitter: EventEmitter, timeout: Duration) -> Self {
        Self {
            emitter,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Ask for a decision and wait for it.
    ///
    /// The slot is registered before the event is emitted, so an observer
    /// that answers synchronously from inside the sink still finds it.
    pub async fn request_decision(&self, host: &str, fingerprint: &str) -> PromptOutcome {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id: id.clone(),
        };

        info!("Host key prompt {} for {} ({})", id, host, fingerprint);
        self.emitter.emit(
            HOSTKEY_PROMPT,
            &HostKeyPrompt {
                id: id.clone(),
                host: host.to_string(),
                fingerprint: fingerprint.to_string(),
            },
        );

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(true)) => PromptOutcome::Allowed,
            Ok(Ok(false)) => PromptOutcome::Denied,
            // Sender dropped without an answer
            Ok(Err(_)) => PromptOutcome::Denied,
            Err(_) => {
                warn!("Host key prompt {} for {} timed out", id, host);
                PromptOutcome::TimedOut
            }
        }
    }

    /// Deliver the human's answer for prompt `id`
    pub fn resolve(&self, id: &str, allowed: bool) -> Result<(), PromptError> {
        let tx = self
            .pending
            .lock()
            .remove(id)
            .ok_or_else(|| PromptError::NotFound(id.to_string()))?;

        debug!("Host key prompt {} resolved: allowed={}", id, allowed);
        // Receiver may have just timed out; the answer is then discarded
        let _ = tx.send(allowed);
        Ok(())
    }

    /// Number of prompts still waiting
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
