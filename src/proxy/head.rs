//! Proxy request head: request line + headers, read with `httparse`.

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 4096;
const MAX_HEADERS: usize = 128;

/// Why a request could not be read. Each variant maps to the status sent back.
#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    /// Peer closed before sending anything; nothing to answer.
    #[error("connection closed before a request was received")]
    Closed,

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("chunked request bodies are not supported")]
    LengthRequired,

    #[error("{0}")]
    Malformed(String),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl HeadError {
    pub fn status(&self) -> u16 {
        match self {
            Self::TooLarge(_) => 431,
            Self::BodyTooLarge(_) => 413,
            Self::LengthRequired => 411,
            Self::Closed | Self::Malformed(_) | Self::Io(_) => 400,
        }
    }
}

/// Parsed request line and headers, in arrival order.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor HTTP version (`1` for HTTP/1.1).
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value of `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Declared body length; no `Content-Length` means no body.
    pub fn content_length(&self) -> Result<usize, HeadError> {
        if self
            .header("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
        {
            return Err(HeadError::LengthRequired);
        }
        match self.header("content-length") {
            None => Ok(0),
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| HeadError::Malformed(format!("invalid Content-Length: {v:?}"))),
        }
    }

    /// Absolute target URL: the absolute-form target as given, or `Host` +
    /// origin-form path over plain http.
    pub fn absolute_url(&self) -> Result<reqwest::Url, HeadError> {
        let target = self.target.trim();
        let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
        let raw = if lower.starts_with("http://") || lower.starts_with("https://") {
            target.to_string()
        } else if target.starts_with('/') {
            let host = self
                .header("host")
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .ok_or_else(|| HeadError::Malformed("relative target without Host header".into()))?;
            format!("http://{host}{target}")
        } else {
            return Err(HeadError::Malformed(format!("unsupported request target {target:?}")));
        };

        let url = reqwest::Url::parse(&raw)
            .map_err(|e| HeadError::Malformed(format!("invalid target URL {raw:?}: {e}")))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(HeadError::Malformed(format!("target URL {raw:?} has no host")));
        }
        Ok(url)
    }

    /// `host:port` of a CONNECT target. The port defaults to 443.
    pub fn connect_authority(&self) -> Result<(String, u16), HeadError> {
        let target = self.target.trim();
        let bad = || HeadError::Malformed(format!("invalid CONNECT target {target:?}"));

        let (host, port) = if let Some(rest) = target.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| bad())?,
                None if tail.is_empty() => 443,
                None => return Err(bad()),
            };
            (host, port)
        } else {
            match target.rsplit_once(':') {
                Some((host, p)) if !host.contains(':') => (host, p.parse().map_err(|_| bad())?),
                Some(_) => return Err(bad()),
                None => (target, 443),
            }
        };

        if host.is_empty() {
            return Err(bad());
        }
        Ok((host.to_string(), port))
    }
}

/// Read a request head of at most `max_bytes`.
///
/// Returns the head and any bytes read past it (start of the body, or early
/// tunnel payload).
pub async fn read_head<R>(reader: &mut R, max_bytes: usize) -> Result<(RequestHead, Vec<u8>), HeadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                HeadError::Closed
            } else {
                HeadError::Malformed("connection closed mid-head".into())
            });
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                if len > max_bytes {
                    return Err(HeadError::TooLarge(max_bytes));
                }
                let head = RequestHead {
                    method: req.method.unwrap_or_default().to_string(),
                    target: req.path.unwrap_or_default().to_string(),
                    version: req.version.unwrap_or(1),
                    headers: req
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect(),
                };
                return Ok((head, buf[len..].to_vec()));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() >= max_bytes {
                    return Err(HeadError::TooLarge(max_bytes));
                }
            }
            Err(httparse::Error::TooManyHeaders) => return Err(HeadError::TooLarge(max_bytes)),
            Err(e) => return Err(HeadError::Malformed(format!("bad request head: {e}"))),
        }
    }
}

/// Read exactly `len` body bytes, starting from `prefix` (bytes already read
/// past the head). Rejects bodies above `max_bytes` before reading them.
pub async fn read_body<R>(
    reader: &mut R,
    mut prefix: Vec<u8>,
    len: usize,
    max_bytes: usize,
) -> Result<Vec<u8>, HeadError>
where
    R: AsyncRead + Unpin,
{
    if len > max_bytes {
        return Err(HeadError::BodyTooLarge(max_bytes));
    }
    if prefix.len() >= len {
        prefix.truncate(len);
        return Ok(prefix);
    }

    let remaining = (len - prefix.len()) as u64;
    (&mut *reader).take(remaining).read_to_end(&mut prefix).await?;
    if prefix.len() < len {
        return Err(HeadError::Malformed(format!(
            "body ended after {} of {len} bytes",
            prefix.len()
        )));
    }
    Ok(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(raw: &str) -> Result<(RequestHead, Vec<u8>), HeadError> {
        let mut reader = raw.as_bytes();
        read_head(&mut reader, 1024).await
    }

    #[tokio::test]
    async fn absolute_form_request() {
        let (head, rest) = parse(
            "GET http://internal.hospital.local/status HTTP/1.1\r\nHost: internal.hospital.local\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.version, 1);
        assert_eq!(head.header("proxy-connection"), Some("keep-alive"));
        assert!(rest.is_empty());
        assert_eq!(
            head.absolute_url().unwrap().as_str(),
            "http://internal.hospital.local/status"
        );
    }

    #[tokio::test]
    async fn origin_form_uses_host_header_and_keeps_body_prefix() {
        let (head, rest) = parse(
            "POST /api/v1?x=1 HTTP/1.1\r\nHost: app.hospital.local:8080\r\nContent-Length: 5\r\n\r\nhel",
        )
        .await
        .unwrap();
        assert_eq!(
            head.absolute_url().unwrap().as_str(),
            "http://app.hospital.local:8080/api/v1?x=1"
        );
        assert_eq!(head.content_length().unwrap(), 5);
        assert_eq!(rest, b"hel");

        let mut tail: &[u8] = b"lo";
        let body = read_body(&mut tail, rest, 5, 1024).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn relative_target_without_host_is_bad_request() {
        let (head, _) = parse("GET /status HTTP/1.1\r\n\r\n").await.unwrap();
        let err = head.absolute_url().unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn oversized_head_is_431() {
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(2048));
        let err = parse(&raw).await.unwrap_err();
        assert_eq!(err.status(), 431);
    }

    #[tokio::test]
    async fn empty_connection_is_closed_and_garbage_is_400() {
        assert!(matches!(parse("").await, Err(HeadError::Closed)));
        assert_eq!(parse("\x01\x02 nonsense\r\n\r\n").await.unwrap_err().status(), 400);
    }

    #[tokio::test]
    async fn body_limits() {
        let err = read_body(&mut &b""[..], Vec::new(), 2048, 1024).await.unwrap_err();
        assert_eq!(err.status(), 413);

        let err = read_body(&mut &b"ab"[..], Vec::new(), 5, 1024).await.unwrap_err();
        assert_eq!(err.status(), 400);

        let (head, _) = parse("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(head.content_length().unwrap_err().status(), 411);
    }

    #[tokio::test]
    async fn connect_authority_forms() {
        let authority = |target: &str| RequestHead {
            method: "CONNECT".into(),
            target: target.into(),
            version: 1,
            headers: Vec::new(),
        }
        .connect_authority();

        assert_eq!(authority("target.example.com:443").unwrap(), ("target.example.com".into(), 443));
        assert_eq!(authority("target.example.com").unwrap(), ("target.example.com".into(), 443));
        assert_eq!(authority("[::1]:8443").unwrap(), ("::1".into(), 8443));
        assert_eq!(authority("[::1]").unwrap(), ("::1".into(), 443));
        assert!(authority(":443").is_err());
        assert!(authority("host:notaport").is_err());
    }
}
