//! Responses written back to proxy callers.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::head::HeadError;
use crate::protocol::RelayMessage;
use crate::util::{is_framing_header, is_framing_header_except_length};

/// A complete response. Framing (`Content-Length`, `Connection: close`) is
/// always written by [`ProxyResponse::write_to`], never copied from
/// `headers`; an upstream `Content-Length` kept in `headers` is only used for
/// the length of a bodiless HEAD answer.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    /// Plain-text error response.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "text/plain; charset=utf-8".into())],
            body: message.into().into_bytes(),
        }
    }

    /// Translate a relayed RESPONSE. Missing status becomes 500; an `error`
    /// with no body becomes the plain-text body.
    pub fn from_relay(message: RelayMessage) -> Self {
        let status = message.status_code.unwrap_or(500);
        let body = message.body.unwrap_or_default();

        if body.is_empty() {
            if let Some(error) = message.error.filter(|e| !e.is_empty()) {
                return Self::error(status, error);
            }
        }

        Self {
            status,
            headers: message
                .headers
                .into_iter()
                .filter(|(name, _)| !is_framing_header_except_length(name))
                .collect(),
            body: body.into_bytes(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize as HTTP/1.1. `head_only` suppresses the body (HEAD requests)
    /// but keeps its `Content-Length`; with no body at all the upstream's
    /// declared length is reported instead.
    pub async fn write_to<W>(&self, writer: &mut W, head_only: bool) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            if is_framing_header(name) || value.contains(|c: char| c == '\r' || c == '\n') {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n", self.content_length(head_only)));
        out.push_str("Connection: close\r\n\r\n");

        writer.write_all(out.as_bytes()).await?;
        if !head_only {
            writer.write_all(&self.body).await?;
        }
        writer.flush().await
    }
}

impl ProxyResponse {
    fn content_length(&self, head_only: bool) -> u64 {
        let declared = self
            .header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        match declared {
            Some(len) if head_only && self.body.is_empty() => len,
            _ => self.body.len() as u64,
        }
    }
}

impl From<HeadError> for ProxyResponse {
    fn from(err: HeadError) -> Self {
        Self::error(err.status(), err.to_string())
    }
}

/// Canonical reason phrase, `Unknown` for unregistered codes.
pub fn reason_phrase(status: u16) -> &'static str {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}
