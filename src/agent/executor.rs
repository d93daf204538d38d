//! Executes relayed REQUESTs against the internal network.
//!
//! Every REQUEST yields exactly one RESPONSE carrying the same `sessionId`:
//! the upstream answer on success, 403 for hosts outside the allow-list, 500
//! with a diagnostic `error` for anything else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::protocol::RelayMessage;
use crate::routing::{DomainFilter, DomainRouter};
use crate::tunnel::RequestHandler;

/// Request headers never copied onto the outgoing call. `Content-Type` is
/// handled together with the body. `Accept-Encoding` is dropped because
/// bodies travel back as text and this client does not decompress.
const SKIPPED_HEADERS: &[&str] = &[
    "content-length",
    "host",
    "connection",
    "content-type",
    "accept-encoding",
];

#[derive(Clone)]
pub struct Executor {
    client: reqwest::Client,
    router: Arc<DomainRouter>,
    timeout: Duration,
}

impl Executor {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let router = DomainRouter::agent(DomainFilter::parse(&config.allowed_domains)?);
        let timeout = Duration::from_secs(config.request_timeout_secs);

        let mut builder = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone());
        if config.accept_invalid_certs {
            warn!("Agent: TLS certificate validation is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build agent HTTP client: {e}")))?;

        Ok(Self {
            client,
            router: Arc::new(router),
            timeout,
        })
    }

    pub fn router(&self) -> &DomainRouter {
        &self.router
    }

    /// Run one REQUEST and build its RESPONSE.
    pub async fn execute(&self, request: RelayMessage) -> RelayMessage {
        let Some(session_id) = request.session_id.clone() else {
            warn!("Agent: REQUEST without sessionId");
            return RelayMessage::failure(None, 500, "REQUEST is missing sessionId");
        };
        let (Some(method), Some(url)) = (request.method.as_deref(), request.url.as_deref()) else {
            return RelayMessage::failure(Some(session_id), 500, "REQUEST is missing method or url");
        };

        let url = match reqwest::Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                return RelayMessage::failure(Some(session_id), 500, format!("Invalid URL {url:?}: {e}"))
            }
        };
        let host = url.host_str().unwrap_or_default();
        if !self.router.is_allowed(host) {
            warn!(session_id = %session_id, "Agent: blocked request to {host}");
            return RelayMessage::failure(Some(session_id), 403, format!("Domain not allowed: {host}"));
        }

        let method = match Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
            Ok(m) if m == Method::CONNECT => {
                return RelayMessage::failure(Some(session_id), 500, "CONNECT cannot be executed by the agent")
            }
            Ok(m) => m,
            Err(_) => {
                return RelayMessage::failure(Some(session_id), 500, format!("Invalid method {method:?}"))
            }
        };

        info!(session_id = %session_id, "Agent: {method} {url}");
        let mut call = self.client.request(method.clone(), url.clone());
        for (name, value) in &request.headers {
            if SKIPPED_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)) {
                continue;
            }
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(n), Ok(v)) => call = call.header(n, v),
                _ => debug!("Agent: skipping unrepresentable header {name:?}"),
            }
        }
        let has_body = request.body.as_deref().is_some_and(|b| !b.is_empty());
        if has_body && matches!(method, Method::POST | Method::PUT | Method::PATCH) {
            let body = request.body.clone().unwrap_or_default();
            let content_type = request.header("content-type").unwrap_or("application/json");
            call = call.header(CONTENT_TYPE, content_type).body(body);
        }

        let response = match call.send().await {
            Ok(r) => r,
            Err(e) => {
                let reason = self.describe(&e, &url);
                warn!(session_id = %session_id, "Agent: {reason}");
                return RelayMessage::failure(Some(session_id), 500, reason);
            }
        };

        let status = response.status().as_u16();
        let headers = combine_headers(response.headers());
        match response.text().await {
            Ok(body) => {
                debug!(session_id = %session_id, status, bytes = body.len(), "Agent: response ready");
                RelayMessage::response(Some(session_id), status, headers, Some(body))
            }
            Err(e) => {
                let reason = self.describe(&e, &url);
                warn!(session_id = %session_id, "Agent: {reason}");
                RelayMessage::failure(Some(session_id), 500, reason)
            }
        }
    }

    fn describe(&self, err: &reqwest::Error, url: &reqwest::Url) -> String {
        if err.is_timeout() {
            format!("Request to {url} timed out after {}s", self.timeout.as_secs())
        } else if err.is_connect() {
            format!("Could not connect to {url}: {err}")
        } else if err.is_redirect() {
            format!("Too many redirects from {url}")
        } else {
            format!("Request to {url} failed: {err}")
        }
    }
}

impl RequestHandler for Executor {
    fn handle(&self, request: RelayMessage) -> BoxFuture<'static, RelayMessage> {
        let executor = self.clone();
        async move { executor.execute(request).await }.boxed()
    }
}

/// Flatten a header map, joining repeated names with `", "`.
fn combine_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .keys()
        .map(|name| {
            let joined = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ");
            (name.as_str().to_string(), joined)
        })
        .collect()
}
