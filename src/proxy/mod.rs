//! Edge proxy: local HTTP/CONNECT listener.
//!
//! Each accepted connection carries exactly one request:
//!
//! - `CONNECT host:port` → direct TCP tunnel ([`connect`]).
//! - Plain HTTP for a host in the domain filter → relayed ([`relayed`]).
//! - Any other plain HTTP → direct passthrough ([`direct`]).
//!
//! Per-connection failures become an HTTP status for that caller; the accept
//! loop keeps serving.

pub mod connect;
pub mod direct;
pub mod head;
pub mod relayed;
pub mod response;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{Config, EdgeConfig};
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::routing::{DomainFilter, DomainRouter};
use crate::sessions::SessionTable;
use crate::tunnel::{ClientRole, LinkOptions, RelayEndpoint, RelayLink, StartupPolicy};

use direct::DirectClient;
use head::HeadError;
use response::ProxyResponse;

/// Pause after a failed `accept` (e.g. fd exhaustion) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Reason given to sessions still waiting when the proxy stops.
const SHUTDOWN_REASON: &str = "Service Unavailable - proxy is shutting down";

/// Limits and timeouts for request handling.
#[derive(Debug, Clone)]
struct Limits {
    relay_timeout: Duration,
    connect_timeout: Duration,
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl Limits {
    fn from_config(edge: &EdgeConfig) -> Self {
        Self {
            relay_timeout: Duration::from_secs(edge.relay_timeout_secs),
            connect_timeout: Duration::from_secs(edge.connect_timeout_secs),
            max_header_bytes: edge.max_header_bytes,
            max_body_bytes: edge.max_body_bytes,
        }
    }
}

/// State shared by every connection handler.
struct ProxyContext {
    router: DomainRouter,
    sessions: SessionTable,
    link: RelayLink,
    direct: DirectClient,
    limits: Limits,
}

/// Entry point for the edge side.
pub struct EdgeProxy;

impl EdgeProxy {
    /// Bind the listener, connect to the relay, and start accepting.
    ///
    /// Fails if the listen address cannot be bound or the first relay
    /// connection cannot be established; neither is retried.
    pub async fn start(config: &Config) -> Result<EdgeHandle> {
        let router = DomainRouter::edge(DomainFilter::parse(&config.edge.domain_filter)?);
        let endpoint = RelayEndpoint::new(&config.relay.url, ClientRole::Edge, &config.relay.token)?;
        let direct = DirectClient::new(Duration::from_secs(config.edge.direct_timeout_secs))?;

        let listener = TcpListener::bind(&config.edge.listen)
            .await
            .map_err(|source| Error::Bind {
                addr: config.edge.listen.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let lifecycle = Lifecycle::new();
        let sessions = SessionTable::new();
        let link = RelayLink::new(
            endpoint,
            LinkOptions::from_config(&config.relay),
            sessions.clone(),
            None,
            lifecycle.clone(),
        );
        link.start(StartupPolicy::FailFast).await?;

        if router.filter().is_empty() {
            info!("Proxy: domain filter empty, all traffic goes direct");
        } else {
            info!("Proxy: relaying hosts matching {}", router.filter());
        }
        info!("Proxy: listening on {local_addr}");

        let ctx = Arc::new(ProxyContext {
            router,
            sessions: sessions.clone(),
            link: link.clone(),
            direct,
            limits: Limits::from_config(&config.edge),
        });
        lifecycle.spawn(accept_loop(listener, ctx, lifecycle.clone()));

        Ok(EdgeHandle {
            local_addr,
            link,
            sessions,
            lifecycle,
            grace: config.lifecycle.shutdown_grace(),
        })
    }
}

/// Running edge proxy.
pub struct EdgeHandle {
    local_addr: SocketAddr,
    link: RelayLink,
    sessions: SessionTable,
    lifecycle: Lifecycle,
    grace: Duration,
}

impl EdgeHandle {
    /// Bound listener address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn link(&self) -> &RelayLink {
        &self.link
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Stop accepting, answer every waiting session with 503, close the
    /// relay link and wait up to the shutdown grace for tasks to finish.
    ///
    /// Returns `true` if every task finished within the grace period.
    pub async fn stop(self) -> bool {
        info!("Proxy: stopping");
        self.lifecycle.cancel();
        let drained = self.sessions.drain_all(SHUTDOWN_REASON).await;
        if drained > 0 {
            info!(drained, "Proxy: released waiting sessions");
        }
        self.link.close().await;
        self.lifecycle.wait(self.grace).await
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ProxyContext>, lifecycle: Lifecycle) {
    let token = lifecycle.token().clone();
    loop {
        let (stream, peer) = tokio::select! {
            () = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Proxy: accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);

        let ctx = Arc::clone(&ctx);
        let token = token.clone();
        lifecycle.spawn(
            async move { handle_connection(stream, &ctx, &token).await }
                .instrument(info_span!("proxy_conn", %peer)),
        );
    }
    info!("Proxy: accept loop stopped");
}

async fn handle_connection(mut stream: TcpStream, ctx: &ProxyContext, token: &CancellationToken) {
    let read = tokio::select! {
        () = token.cancelled() => return,
        r = head::read_head(&mut stream, ctx.limits.max_header_bytes) => r,
    };
    let (head, early) = match read {
        Ok(pair) => pair,
        Err(HeadError::Closed) => return,
        Err(e) => {
            debug!("Proxy: rejecting request: {e}");
            let _ = ProxyResponse::from(e).write_to(&mut stream, false).await;
            return;
        }
    };

    if head.is_connect() {
        match head.connect_authority() {
            Ok((host, port)) => {
                connect::tunnel(stream, &host, port, early, ctx.limits.connect_timeout, token).await;
            }
            Err(e) => {
                let _ = ProxyResponse::from(e).write_to(&mut stream, false).await;
            }
        }
        return;
    }

    let head_only = head.method.eq_ignore_ascii_case("HEAD");
    let response = match serve_http(&mut stream, &head, early, ctx).await {
        Ok(response) | Err(response) => response,
    };
    info!(
        method = %head.method,
        target = %head.target,
        status = response.status,
        "Proxy: request served"
    );
    if let Err(e) = response.write_to(&mut stream, head_only).await {
        debug!("Proxy: failed to write response: {e}");
    }
    let _ = stream.shutdown().await;
}

/// Route one plain HTTP request. `Err` carries an early rejection.
async fn serve_http(
    stream: &mut TcpStream,
    head: &head::RequestHead,
    early: Vec<u8>,
    ctx: &ProxyContext,
) -> std::result::Result<ProxyResponse, ProxyResponse> {
    let url = head.absolute_url()?;
    let length = head.content_length()?;
    let body = head::read_body(stream, early, length, ctx.limits.max_body_bytes).await?;

    let host = url.host_str().unwrap_or_default().to_string();
    if ctx.router.should_relay(&host) {
        debug!("Proxy: {host} → relay");
        Ok(relayed::relay(
            &ctx.link,
            &ctx.sessions,
            ctx.limits.relay_timeout,
            &head.method,
            url.as_str(),
            &head.headers,
            &body,
        )
        .await)
    } else {
        debug!("Proxy: {host} → direct");
        Ok(ctx
            .direct
            .forward(&head.method, url, &head.headers, body)
            .await)
    }
}
