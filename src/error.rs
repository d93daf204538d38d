//! Crate-wide error type.
//!
//! Only startup and link-level failures travel as [`Error`]. Per-request
//! failures on the proxy and agent paths are turned into HTTP status codes at
//! the connection boundary and never escape a handler.

/// Errors surfaced by the relay link, the runners and configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Dialing or handshaking with the relay failed.
    #[error("relay connection failed: {0}")]
    Connect(String),

    /// A send was attempted while the link was not `Open`.
    #[error("relay link is not open")]
    NotConnected,

    #[error("relay send failed: {0}")]
    Send(String),

    /// Session ids are random; a collision means a caller reused an id.
    #[error("session {0} is already registered")]
    DuplicateSession(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
