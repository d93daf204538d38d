//! Outbound WS connection to the relay.
//!
//! [`RelayLink`] owns the socket and its state machine:
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Open ─▶ (error | close frame | stop) ─▶ Disconnected
//!                                  └──▶ Closing ─▶ Disconnected
//! ```
//!
//! While `Open`, one receive loop dispatches inbound frames and one heartbeat
//! task sends a PING every `heartbeat` interval. Sends are serialized through
//! the sink mutex so concurrent writers never interleave frames.
//!
//! The edge starts with [`StartupPolicy::FailFast`]: a failed first dial is a
//! start error and a dropped link stays down. The agent starts with
//! [`StartupPolicy::RetryForever`] and redials after a fixed backoff until
//! stopped.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RelayEndpoint, RequestHandler};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::protocol::{MessageType, RelayMessage};
use crate::sessions::SessionTable;
use crate::state::{LinkEventKind, LinkStats};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Bound on flushing a close frame to a peer that may no longer be reading.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// A frame write that makes no progress for this long ends the connection.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection state, published through [`RelayLink::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// How a runner brings the link up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPolicy {
    /// Dial once; failure is returned to the caller and nothing retries.
    FailFast,
    /// Dial in the background, redialing `backoff` after every failure or
    /// disconnect until the lifecycle is cancelled.
    RetryForever { backoff: Duration },
}

/// Keepalive tuning.
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub heartbeat: Duration,
    /// Close an `Open` link after this long without inbound frames.
    pub liveness_timeout: Option<Duration>,
}

impl LinkOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            heartbeat: config.heartbeat_interval(),
            liveness_timeout: config.liveness_timeout(),
        }
    }
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            liveness_timeout: None,
        }
    }
}

/// Writable half of the current connection.
struct Connection {
    sink: WsSink,
    /// Cancelled to end this connection's receive loop and heartbeat.
    closed: CancellationToken,
}

struct LinkInner {
    endpoint: RelayEndpoint,
    options: LinkOptions,
    sessions: SessionTable,
    handler: Option<Arc<dyn RequestHandler>>,
    lifecycle: Lifecycle,
    conn: Mutex<Option<Connection>>,
    /// `closed` token of the current connection, reachable without the sink
    /// lock so a stalled write can be interrupted.
    current: std::sync::Mutex<Option<CancellationToken>>,
    state: watch::Sender<LinkState>,
    stats: LinkStats,
}

/// Persistent connection to the relay. Cheap to clone.
#[derive(Clone)]
pub struct RelayLink {
    inner: Arc<LinkInner>,
}

impl RelayLink {
    /// `handler` executes inbound REQUESTs (agent side); `None` on the edge.
    pub fn new(
        endpoint: RelayEndpoint,
        options: LinkOptions,
        sessions: SessionTable,
        handler: Option<Arc<dyn RequestHandler>>,
        lifecycle: Lifecycle,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Arc::new(LinkInner {
                endpoint,
                options,
                sessions,
                handler,
                lifecycle,
                conn: Mutex::new(None),
                current: std::sync::Mutex::new(None),
                state,
                stats: LinkStats::new(),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Connection-status notifications. The receiver sees every state the
    /// link settles in; intermediate states may be coalesced.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.inner.stats
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.inner.endpoint
    }

    /// Bring the link up according to `policy`.
    pub async fn start(&self, policy: StartupPolicy) -> Result<()> {
        match policy {
            StartupPolicy::FailFast => self.open().await.map(drop),
            StartupPolicy::RetryForever { backoff } => {
                self.inner
                    .lifecycle
                    .spawn(self.clone().reconnect_loop(backoff));
                Ok(())
            }
        }
    }

    /// Serialize `message` and write it as one text frame.
    ///
    /// Fails with [`Error::NotConnected`] unless the link is `Open`. A write
    /// that fails or stalls past the send timeout marks the link
    /// `Disconnected` and ends the connection. Closing the connection
    /// interrupts a write in progress.
    pub async fn send(&self, message: &RelayMessage) -> Result<()> {
        let text = message.encode()?;
        let Some(current) = self.connection_token() else {
            return Err(Error::NotConnected);
        };
        let mut guard = tokio::select! {
            guard = self.inner.conn.lock() => guard,
            () = current.cancelled() => return Err(Error::NotConnected),
        };
        let Some(conn) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        if self.state() != LinkState::Open || conn.closed.is_cancelled() {
            return Err(Error::NotConnected);
        }

        let closed = conn.closed.clone();
        let written = tokio::select! {
            r = tokio::time::timeout(SEND_TIMEOUT, conn.sink.send(Message::Text(text.into()))) => r,
            () = closed.cancelled() => return Err(Error::NotConnected),
        };
        let detail = match written {
            Ok(Ok(())) => {
                self.inner
                    .stats
                    .messages_sent
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Ok(Err(e)) => self.inner.endpoint.scrub(&e.to_string()),
            Err(_) => format!("write stalled for {}s", SEND_TIMEOUT.as_secs()),
        };

        if let Some(conn) = guard.take() {
            conn.closed.cancel();
        }
        drop(guard);
        warn!("Relay: send failed: {detail}");
        self.inner
            .stats
            .push_event(LinkEventKind::SendFailed, detail.clone())
            .await;
        self.set_state(LinkState::Disconnected);
        Err(Error::Send(detail))
    }

    /// Close the current connection, if any, with a close frame.
    ///
    /// The connection is cancelled before the sink is touched, so a writer
    /// stuck on a peer that stopped reading cannot hold this up; the close
    /// frame is best effort.
    pub async fn close(&self) {
        let Some(current) = self.connection_token() else {
            return;
        };
        self.set_state(LinkState::Closing);
        current.cancel();

        let conn = match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.inner.conn.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!("Relay: sink still busy, closing without a close frame");
                None
            }
        };
        if let Some(mut conn) = conn {
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, conn.sink.close()).await;
        }
    }

    fn connection_token(&self) -> Option<CancellationToken> {
        self.inner.current.lock().ok().and_then(|current| current.clone())
    }

    fn set_connection_token(&self, token: Option<CancellationToken>) {
        if let Ok(mut current) = self.inner.current.lock() {
            *current = token;
        }
    }

    /// Dial, publish `Open`, and spawn the receive loop and heartbeat.
    /// The returned handle completes when the connection ends.
    async fn open(&self) -> Result<JoinHandle<()>> {
        let token = self.inner.lifecycle.token().clone();
        self.set_state(LinkState::Connecting);
        info!("Relay: connecting to {}", self.inner.endpoint);

        let result = tokio::select! {
            r = tokio_tungstenite::connect_async(self.inner.endpoint.dial_url()) => r,
            () = token.cancelled() => {
                self.set_state(LinkState::Disconnected);
                return Err(Error::Connect("stopped while connecting".to_string()));
            }
        };
        let ws = match result {
            Ok((ws, _response)) => ws,
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                return Err(Error::Connect(self.inner.endpoint.scrub(&e.to_string())));
            }
        };

        let (sink, stream) = ws.split();
        let closed = token.child_token();
        *self.inner.conn.lock().await = Some(Connection {
            sink,
            closed: closed.clone(),
        });
        self.set_connection_token(Some(closed.clone()));

        self.inner.stats.connected.store(true, Ordering::Relaxed);
        self.inner.stats.touch_inbound();
        self.inner
            .stats
            .push_event(LinkEventKind::Connected, self.inner.endpoint.to_string())
            .await;
        info!("Relay: connected to {}", self.inner.endpoint);
        self.set_state(LinkState::Open);

        let heartbeat = self
            .inner
            .lifecycle
            .spawn(self.clone().heartbeat(closed.clone()));
        Ok(self
            .inner
            .lifecycle
            .spawn(self.clone().receive_loop(stream, closed, heartbeat)))
    }

    async fn reconnect_loop(self, backoff: Duration) {
        let token = self.inner.lifecycle.token().clone();
        let mut attempt: u64 = 0;
        loop {
            if attempt > 0 {
                self.inner.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .stats
                    .push_event(LinkEventKind::ReconnectAttempt, format!("attempt {attempt}"))
                    .await;
            }
            attempt += 1;

            match self.open().await {
                Ok(connection) => {
                    let _ = connection.await;
                }
                Err(e) => {
                    if !token.is_cancelled() {
                        warn!("Relay: {e}, retrying in {}s", backoff.as_secs());
                    }
                }
            }

            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
        }
        info!("Relay: reconnect loop stopped");
    }

    async fn receive_loop(
        self,
        mut stream: SplitStream<WsStream>,
        closed: CancellationToken,
        heartbeat: JoinHandle<()>,
    ) {
        let reason = loop {
            tokio::select! {
                () = closed.cancelled() => break "closed locally".to_string(),
                frame = stream.next() => {
                    let Some(frame) = frame else {
                        break "stream ended".to_string();
                    };
                    match frame {
                        Ok(Message::Text(text)) => {
                            self.inner.stats.record_inbound();
                            self.dispatch(RelayMessage::decode(text.as_str())).await;
                        }
                        Ok(Message::Binary(data)) => {
                            self.inner.stats.record_inbound();
                            match std::str::from_utf8(&data) {
                                Ok(text) => self.dispatch(RelayMessage::decode(text)).await,
                                Err(_) => warn!(len = data.len(), "Relay: dropping non-UTF-8 binary frame"),
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            info!(?frame, "Relay: close frame received");
                            break "closed by relay".to_string();
                        }
                        Ok(Message::Ping(_) | Message::Pong(_)) => self.inner.stats.touch_inbound(),
                        Ok(Message::Frame(_)) => {}
                        Err(e) => {
                            break format!("receive error: {}", self.inner.endpoint.scrub(&e.to_string()));
                        }
                    }
                }
            }
        };
        heartbeat.abort();
        self.teardown(&reason).await;
    }

    /// Connection ended: drop the sink, publish `Disconnected`, and fail any
    /// in-flight sessions unless this is a deliberate stop.
    async fn teardown(&self, reason: &str) {
        let deliberate =
            self.inner.lifecycle.is_stopping() || self.state() == LinkState::Closing;

        if let Some(current) = self.connection_token() {
            current.cancel();
        }
        self.set_connection_token(None);
        let conn = match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.inner.conn.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut conn) = conn {
            conn.closed.cancel();
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, conn.sink.close()).await;
        }

        self.inner.stats.connected.store(false, Ordering::Relaxed);
        self.inner
            .stats
            .push_event(LinkEventKind::Disconnected, reason)
            .await;
        if deliberate {
            info!("Relay: disconnected ({reason})");
        } else {
            warn!("Relay: disconnected ({reason})");
        }
        self.set_state(LinkState::Disconnected);

        if !deliberate {
            self.inner
                .sessions
                .fail_all(502, "Relay connection lost")
                .await;
        }
    }

    async fn dispatch(&self, message: RelayMessage) {
        match message.kind {
            MessageType::Request => self.dispatch_request(message),
            MessageType::Response => {
                let Some(session_id) = message.session_id.clone() else {
                    warn!("Relay: RESPONSE without sessionId dropped");
                    return;
                };
                if !self.inner.sessions.resolve(&session_id, message).await {
                    info!(session_id = %session_id, "Relay: response for unknown session (late or duplicate)");
                }
            }
            MessageType::Ping => {
                if let Err(e) = self.send(&RelayMessage::pong()).await {
                    warn!("Relay: failed to answer PING: {e}");
                }
            }
            MessageType::Pong => debug!("Relay: PONG"),
            MessageType::Error => warn!(
                error = message.error.as_deref().unwrap_or(""),
                "Relay: undecodable message"
            ),
        }
    }

    /// Hand a REQUEST to its own task so a slow call never stalls the loop.
    fn dispatch_request(&self, request: RelayMessage) {
        let link = self.clone();
        let Some(handler) = self.inner.handler.clone() else {
            warn!(
                session_id = request.session_id.as_deref().unwrap_or(""),
                "Relay: REQUEST received but this side does not execute requests"
            );
            let reply = RelayMessage::failure(
                request.session_id,
                501,
                "Peer does not execute requests",
            );
            self.inner.lifecycle.spawn(async move {
                let _ = link.send(&reply).await;
            });
            return;
        };

        self.inner.lifecycle.spawn(async move {
            let session_id = request.session_id.clone();
            let response = handler.handle(request).await;
            if let Err(e) = link.send(&response).await {
                warn!(?session_id, "Relay: failed to send RESPONSE: {e}");
            }
        });
    }

    /// Periodic PING; also enforces the optional liveness timeout.
    async fn heartbeat(self, closed: CancellationToken) {
        let period = self.inner.options.heartbeat;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                () = closed.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Some(limit) = self.inner.options.liveness_timeout {
                let age_ms = self.inner.stats.inbound_age_ms();
                if age_ms > limit.as_millis() as u64 {
                    warn!(age_ms, "Relay: no inbound traffic within liveness timeout, closing link");
                    self.inner
                        .stats
                        .push_event(LinkEventKind::LivenessTimeout, format!("silent for {age_ms}ms"))
                        .await;
                    closed.cancel();
                    break;
                }
            }

            if let Err(e) = self.send(&RelayMessage::ping()).await {
                debug!("Relay: PING not sent: {e}");
                break;
            }
        }
    }

    fn set_state(&self, next: LinkState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = ?next, "Relay: link state changed");
        }
    }
}
