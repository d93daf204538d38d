//! Relay tunnel.
//!
//! Both sides dial out to the relay over a WebSocket and exchange
//! [`RelayMessage`](crate::protocol::RelayMessage) frames:
//!
//! - **Edge** (`type=A`): sends REQUESTs, matches RESPONSEs back to waiting
//!   proxy handlers through the [`SessionTable`](crate::sessions::SessionTable).
//! - **Agent** (`type=B`): executes REQUESTs through a [`RequestHandler`] and
//!   answers each with exactly one RESPONSE.

pub mod client;

use std::fmt;

use futures_util::future::BoxFuture;

use crate::error::{Error, Result};
use crate::protocol::RelayMessage;
use crate::util::redact;

pub use client::{LinkOptions, LinkState, RelayLink, StartupPolicy};

/// Which side of the pairing this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// External-facing proxy (`type=A`).
    Edge,
    /// Internal request executor (`type=B`).
    Agent,
}

impl ClientRole {
    pub fn as_query(&self) -> &'static str {
        match self {
            Self::Edge => "A",
            Self::Agent => "B",
        }
    }
}

/// Executes REQUESTs received over the link. Installed on the agent side.
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the RESPONSE for `request`. Must always return one, carrying
    /// the request's `sessionId`, even when execution fails.
    fn handle(&self, request: RelayMessage) -> BoxFuture<'static, RelayMessage>;
}

/// Relay dial target: `{ws|wss}://{host}:{port}/relay?type={A|B}&token={token}`.
///
/// `Display` renders the URL with the token masked; use it for logging.
#[derive(Clone)]
pub struct RelayEndpoint {
    dial_url: String,
    redacted: String,
    token: String,
    role: ClientRole,
}

impl RelayEndpoint {
    /// Build the dial URL from a relay base URL. `http`/`https` are mapped to
    /// `ws`/`wss`; any path or query on `base` is replaced.
    pub fn new(base: &str, role: ClientRole, token: &str) -> Result<Self> {
        let mut url = reqwest::Url::parse(base.trim())
            .map_err(|e| Error::Config(format!("invalid relay url {base:?}: {e}")))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(Error::Config(format!(
                    "unsupported relay url scheme {other:?} (expected ws, wss, http or https)"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| Error::Config(format!("cannot use scheme {scheme} for {base:?}")))?;
        if url.host_str().is_none() {
            return Err(Error::Config(format!("relay url {base:?} has no host")));
        }
        url.set_path("/relay");
        url.set_query(None);
        url.set_fragment(None);

        let mut redacted = url.clone();
        redacted
            .query_pairs_mut()
            .append_pair("type", role.as_query())
            .append_pair("token", "***");
        url.query_pairs_mut()
            .append_pair("type", role.as_query())
            .append_pair("token", token);

        Ok(Self {
            dial_url: url.into(),
            redacted: redacted.into(),
            token: token.to_string(),
            role,
        })
    }

    /// Full URL including the clear-text token. Never log this.
    pub fn dial_url(&self) -> &str {
        &self.dial_url
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    /// Mask the token in text that may echo the dial URL (e.g. transport errors).
    pub fn scrub(&self, text: &str) -> String {
        let encoded = self
            .dial_url
            .rsplit_once("token=")
            .map_or("", |(_, tail)| tail);
        redact(&redact(text, &self.token), encoded)
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)
    }
}

impl fmt::Debug for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayEndpoint")
            .field("url", &self.redacted)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_base_maps_to_ws_relay_path() {
        let ep = RelayEndpoint::new("http://relay.example.com:8080", ClientRole::Edge, "abc").unwrap();
        assert_eq!(ep.dial_url(), "ws://relay.example.com:8080/relay?type=A&token=abc");
        assert_eq!(ep.to_string(), "ws://relay.example.com:8080/relay?type=A&token=***");
    }

    #[test]
    fn https_base_maps_to_wss_and_replaces_path() {
        let ep = RelayEndpoint::new("https://relay.example.com:9443/old?x=1", ClientRole::Agent, "t")
            .unwrap();
        assert_eq!(ep.dial_url(), "wss://relay.example.com:9443/relay?type=B&token=t");
    }

    #[test]
    fn token_is_escaped_and_never_displayed() {
        let ep = RelayEndpoint::new("ws://r:1", ClientRole::Agent, "a b&c").unwrap();
        assert!(ep.dial_url().ends_with("token=a+b%26c"));
        assert!(!ep.to_string().contains("a+b"));
        assert!(!format!("{ep:?}").contains("a+b"));
        assert_eq!(ep.scrub("failed: ws://r:1/relay?type=B&token=a+b%26c"), "failed: ws://r:1/relay?type=B&token=***");
    }

    #[test]
    fn rejects_unknown_scheme_and_garbage() {
        assert!(matches!(
            RelayEndpoint::new("ftp://relay", ClientRole::Edge, "t"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RelayEndpoint::new("not a url", ClientRole::Edge, "t"),
            Err(Error::Config(_))
        ));
    }
}
