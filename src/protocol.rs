//! Relay wire protocol.
//!
//! Every frame exchanged with the relay is a flat JSON object:
//!
//! ```json
//! {"type":"REQUEST","sessionId":"…","method":"GET","url":"http://…","headers":{"Accept":"*/*"}}
//! {"type":"RESPONSE","sessionId":"…","statusCode":200,"headers":{…},"body":"OK"}
//! {"type":"PING"}
//! ```
//!
//! Absent optional fields are omitted, never sent as `null`. Decoding is
//! lenient (case-insensitive `type`, numeric strings for `statusCode`,
//! non-string header values) and never fails: a payload that cannot be
//! understood becomes a local [`MessageType::Error`] message so the receive
//! loop keeps running.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminant of a [`RelayMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Request,
    Response,
    Ping,
    Pong,
    /// Produced locally for payloads that failed to decode.
    Error,
}

impl MessageType {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "REQUEST" => Some(Self::Request),
            "RESPONSE" => Some(Self::Response),
            "PING" => Some(Self::Ping),
            "PONG" => Some(Self::Pong),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// The only entity carried over the relay link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Loose mirror of the wire object used only for decoding.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    session_id: Option<String>,
    method: Option<String>,
    url: Option<String>,
    headers: Option<HashMap<String, Value>>,
    body: Option<String>,
    status_code: Option<Value>,
    error: Option<String>,
}

impl RelayMessage {
    fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            session_id: None,
            method: None,
            url: None,
            headers: HashMap::new(),
            body: None,
            status_code: None,
            error: None,
        }
    }

    /// A REQUEST for the agent to execute.
    pub fn request(
        session_id: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
        headers: HashMap<String, String>,
        body: Option<String>,
    ) -> Self {
        Self {
            session_id: Some(session_id.into()),
            method: Some(method.into()),
            url: Some(url.into()),
            headers,
            body,
            ..Self::empty(MessageType::Request)
        }
    }

    /// A successful RESPONSE carrying the upstream status, headers and body.
    pub fn response(
        session_id: Option<String>,
        status_code: u16,
        headers: HashMap<String, String>,
        body: Option<String>,
    ) -> Self {
        Self {
            session_id,
            status_code: Some(status_code),
            headers,
            body,
            ..Self::empty(MessageType::Response)
        }
    }

    /// A RESPONSE describing why the request could not be completed.
    pub fn failure(session_id: Option<String>, status_code: u16, error: impl Into<String>) -> Self {
        Self {
            session_id,
            status_code: Some(status_code),
            error: Some(error.into()),
            ..Self::empty(MessageType::Response)
        }
    }

    pub fn ping() -> Self {
        Self::empty(MessageType::Ping)
    }

    pub fn pong() -> Self {
        Self::empty(MessageType::Pong)
    }

    /// Local stand-in for a payload that could not be decoded.
    pub fn protocol_error(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::empty(MessageType::Error)
        }
    }

    /// Serialize to the flat JSON text sent in a single frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a received frame. Never fails; see the module docs.
    pub fn decode(text: &str) -> Self {
        let wire: WireMessage = match serde_json::from_str(text) {
            Ok(w) => w,
            Err(e) => return Self::protocol_error(format!("JSON parse failed: {e}")),
        };

        let Some(raw_kind) = wire.kind.as_deref() else {
            return Self::protocol_error("missing message type");
        };
        let Some(kind) = MessageType::parse(raw_kind) else {
            return Self::protocol_error(format!("unknown message type: {raw_kind}"));
        };

        let headers = wire
            .headers
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (name, value)
            })
            .collect();

        Self {
            kind,
            session_id: wire.session_id,
            method: wire.method,
            url: wire.url,
            headers,
            body: wire.body,
            status_code: wire.status_code.as_ref().and_then(lenient_status),
            error: wire.error,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Accept `200` as well as `"200"`; anything else is treated as absent.
fn lenient_status(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
