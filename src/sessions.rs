//! In-flight relay sessions on the edge side.
//!
//! Every relayed request registers a single-assignment slot keyed by its
//! `sessionId`. Whichever happens first among response arrival, timeout and
//! shutdown removes the entry and fills the slot; the others find nothing and
//! become no-ops. Removal from the map and completion of the slot happen
//! under the same lock, so a slot is completed at most once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::RelayMessage;

/// A registered session awaiting its RESPONSE.
struct Pending {
    created_at: Instant,
    slot: oneshot::Sender<RelayMessage>,
}

/// Receiving half handed to the request path by [`SessionTable::register`].
pub struct SessionWaiter {
    session_id: String,
    rx: oneshot::Receiver<RelayMessage>,
}

impl SessionWaiter {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Shared table of pending sessions. Cheap to clone.
#[derive(Clone, Default)]
pub struct SessionTable {
    pending: Arc<Mutex<HashMap<String, Pending>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the slot for `session_id`.
    ///
    /// Fails with [`Error::DuplicateSession`] if the id is already in flight.
    pub async fn register(&self, session_id: &str) -> Result<SessionWaiter> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(session_id) {
            return Err(Error::DuplicateSession(session_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            session_id.to_string(),
            Pending {
                created_at: Instant::now(),
                slot: tx,
            },
        );
        Ok(SessionWaiter {
            session_id: session_id.to_string(),
            rx,
        })
    }

    /// Complete the session with `message`. Returns `false` for unknown,
    /// late or duplicate responses.
    pub async fn resolve(&self, session_id: &str, message: RelayMessage) -> bool {
        let Some(entry) = self.pending.lock().await.remove(session_id) else {
            debug!(session_id, "No pending session for response (late or duplicate)");
            return false;
        };
        debug!(
            session_id,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "Session resolved"
        );
        // The waiter may already be gone (handler cancelled); nothing to do then.
        let _ = entry.slot.send(message);
        true
    }

    /// Time the session out: remove it if still present and complete it with
    /// a synthesized 504. Returns the synthesized message.
    pub async fn expire(&self, session_id: &str) -> RelayMessage {
        let timeout = RelayMessage::failure(
            Some(session_id.to_string()),
            504,
            "Gateway Timeout - no response from relay",
        );
        if let Some(entry) = self.pending.lock().await.remove(session_id) {
            warn!(session_id, "Session timed out");
            let _ = entry.slot.send(timeout.clone());
        }
        timeout
    }

    /// Drop a session without completing it (e.g. the REQUEST never left).
    pub async fn discard(&self, session_id: &str) -> bool {
        self.pending.lock().await.remove(session_id).is_some()
    }

    /// Resolve every outstanding session with a synthesized 503 and clear the
    /// table. Returns how many sessions were drained.
    pub async fn drain_all(&self, reason: &str) -> usize {
        self.fail_all(503, reason).await
    }

    /// Resolve every outstanding session with a synthesized `status` response.
    pub async fn fail_all(&self, status: u16, reason: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        for (session_id, entry) in pending.drain() {
            let msg = RelayMessage::failure(Some(session_id), status, reason);
            let _ = entry.slot.send(msg);
        }
        if count > 0 {
            info!(count, status, "Drained {count} pending sessions: {reason}");
        }
        count
    }

    /// Wait for the session's RESPONSE for at most `deadline`.
    ///
    /// On timeout the entry is expired. A response racing the timeout wins if
    /// it filled the slot first; either way exactly one message is returned.
    pub async fn wait(&self, waiter: SessionWaiter, deadline: Duration) -> RelayMessage {
        let SessionWaiter { session_id, mut rx } = waiter;
        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => RelayMessage::failure(Some(session_id), 503, "Session closed"),
            Err(_) => {
                let synthesized = self.expire(&session_id).await;
                rx.try_recv().unwrap_or(synthesized)
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}
