//! Relay link statistics and connection-event history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

/// Link lifecycle event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEventKind {
    Connected,
    Disconnected,
    ReconnectAttempt,
    LivenessTimeout,
    SendFailed,
}

impl LinkEventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ReconnectAttempt => "reconnect_attempt",
            Self::LivenessTimeout => "liveness_timeout",
            Self::SendFailed => "send_failed",
        }
    }
}

/// A link lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct LinkEvent {
    pub at: Instant,
    pub kind: LinkEventKind,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_LINK_EVENTS: usize = 50;

/// Link statistics. Atomics for the hot path, Mutex only for the event log.
pub struct LinkStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    /// Milliseconds since `epoch` at which the last inbound frame arrived.
    pub last_inbound_ms: AtomicU64,
    pub epoch: Instant,
    pub events: Mutex<VecDeque<LinkEvent>>,
}

impl LinkStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            last_inbound_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            events: Mutex::new(VecDeque::with_capacity(MAX_LINK_EVENTS)),
        }
    }

    /// Push a link event, evicting the oldest if at capacity.
    pub async fn push_event(&self, kind: LinkEventKind, detail: impl Into<String>) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_LINK_EVENTS {
            events.pop_front();
        }
        events.push_back(LinkEvent {
            at: Instant::now(),
            kind,
            detail: detail.into(),
        });
    }

    /// Snapshot of the retained events, oldest first.
    pub async fn recent_events(&self) -> Vec<LinkEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    /// Count an inbound message and reset the liveness clock.
    pub fn record_inbound(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.touch_inbound();
    }

    /// Reset the liveness clock without counting a message (transport
    /// ping/pong, fresh connection).
    pub fn touch_inbound(&self) {
        self.last_inbound_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Milliseconds since the last inbound frame.
    pub fn inbound_age_ms(&self) -> u64 {
        (self.epoch.elapsed().as_millis() as u64)
            .saturating_sub(self.last_inbound_ms.load(Ordering::Relaxed))
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_log_is_bounded() {
        let stats = LinkStats::new();
        for i in 0..(MAX_LINK_EVENTS + 5) {
            stats
                .push_event(LinkEventKind::ReconnectAttempt, format!("attempt {i}"))
                .await;
        }
        let events = stats.recent_events().await;
        assert_eq!(events.len(), MAX_LINK_EVENTS);
        assert_eq!(events[0].detail, "attempt 5");
    }

    #[test]
    fn inbound_marks_counter() {
        let stats = LinkStats::new();
        stats.record_inbound();
        stats.record_inbound();
        stats.touch_inbound();
        assert_eq!(stats.messages_received.load(Ordering::Relaxed), 2);
        assert!(stats.inbound_age_ms() < 1000);
    }
}
