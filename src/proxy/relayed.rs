//! Relayed requests: one session per request, correlated by `sessionId`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::response::ProxyResponse;
use crate::protocol::RelayMessage;
use crate::sessions::SessionTable;
use crate::tunnel::RelayLink;
use crate::util::is_proxy_hop_header;

/// Send the request over the relay and wait for the answer. `deadline` covers
/// both the write and the wait.
///
/// A link that is not `Open` fails immediately with 502; no session is
/// registered in that case.
pub async fn relay(
    link: &RelayLink,
    sessions: &SessionTable,
    deadline: Duration,
    method: &str,
    url: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> ProxyResponse {
    if !link.is_open() {
        warn!("Relay: link not open, rejecting {method} {url}");
        return ProxyResponse::error(502, "Bad Gateway - relay is not connected");
    }

    let started = Instant::now();
    let session_id = Uuid::new_v4().to_string();
    let waiter = match sessions.register(&session_id).await {
        Ok(w) => w,
        Err(e) => return ProxyResponse::error(500, e.to_string()),
    };

    let body = (!body.is_empty()).then(|| String::from_utf8_lossy(body).into_owned());
    let request = RelayMessage::request(
        session_id.clone(),
        method,
        url,
        fold_headers(headers),
        body,
    );
    match tokio::time::timeout(deadline, link.send(&request)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            sessions.discard(&session_id).await;
            warn!(session_id = %session_id, "Relay: send failed: {e}");
            return ProxyResponse::error(502, format!("Bad Gateway - {e}"));
        }
        Err(_) => {
            sessions.discard(&session_id).await;
            warn!(session_id = %session_id, "Relay: request not written within {}s", deadline.as_secs());
            return ProxyResponse::error(504, "Gateway Timeout - relay did not accept the request in time");
        }
    }
    debug!(session_id = %session_id, "Relay: {method} {url} sent");

    let remaining = deadline.saturating_sub(started.elapsed());
    let reply = sessions.wait(waiter, remaining).await;
    ProxyResponse::from_relay(reply)
}

/// Collapse headers into the wire map, dropping client→proxy hop headers and
/// joining repeated names with `", "`.
pub fn fold_headers(headers: &[(String, String)]) -> HashMap<String, String> {
    let mut folded: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        if is_proxy_hop_header(name) {
            continue;
        }
        let existing = folded
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned();
        match existing {
            Some(key) => {
                if let Some(joined) = folded.get_mut(&key) {
                    joined.push_str(", ");
                    joined.push_str(value);
                }
            }
            None => {
                folded.insert(name.clone(), value.clone());
            }
        }
    }
    folded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_drops_hop_headers_and_joins_repeats() {
        let headers = vec![
            ("Accept".to_string(), "text/html".to_string()),
            ("Proxy-Connection".to_string(), "keep-alive".to_string()),
            ("accept".to_string(), "application/json".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("X-Trace".to_string(), "1".to_string()),
        ];
        let folded = fold_headers(&headers);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded["Accept"], "text/html, application/json");
        assert_eq!(folded["X-Trace"], "1");
    }
}
