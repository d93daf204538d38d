//! Small helpers shared across modules.

/// Headers that describe the client→proxy hop and must not be forwarded.
///
/// Matches `Proxy-*`, `Connection` and `Keep-Alive` case-insensitively.
pub fn is_proxy_hop_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("proxy-") || lower == "connection" || lower == "keep-alive"
}

/// Headers the front end writes itself when answering a caller; copies coming
/// from upstream or from the relay are dropped.
pub fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("keep-alive")
}

/// Framing headers other than `Content-Length`, which a response to HEAD
/// carries through as the size of the resource.
pub fn is_framing_header_except_length(name: &str) -> bool {
    is_framing_header(name) && !name.eq_ignore_ascii_case("content-length")
}

/// Replace every occurrence of `secret` in `text` with `***`.
///
/// - `redact("ws://r/relay?token=abc", "abc")` → `"ws://r/relay?token=***"`
/// - An empty secret leaves `text` untouched.
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, "***")
}
