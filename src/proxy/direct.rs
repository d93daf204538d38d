//! Direct passthrough for hosts outside the relay filter.

use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use tracing::{debug, warn};

use super::response::ProxyResponse;
use crate::error::{Error, Result};
use crate::util::{is_framing_header_except_length, is_proxy_hop_header};

/// HTTP client that ignores any ambient proxy settings so the edge never
/// routes a request back into itself.
#[derive(Clone)]
pub struct DirectClient {
    client: reqwest::Client,
}

impl DirectClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build direct HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Perform the request and copy the upstream answer back. Failures become
    /// 502 (504 on timeout).
    pub async fn forward(
        &self,
        method: &str,
        url: reqwest::Url,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> ProxyResponse {
        let Ok(method) = reqwest::Method::from_bytes(method.as_bytes()) else {
            return ProxyResponse::error(400, format!("invalid method {method:?}"));
        };

        let mut request = self.client.request(method, url.clone());
        for (name, value) in headers {
            if is_proxy_hop_header(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => request = request.header(n, v),
                _ => debug!("Direct: skipping unrepresentable header {name:?}"),
            }
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!("Direct: {url} timed out");
                return ProxyResponse::error(504, format!("Gateway Timeout - {url} did not respond"));
            }
            Err(e) => {
                warn!("Direct: {url} failed: {e}");
                return ProxyResponse::error(502, format!("Bad Gateway - {e}"));
            }
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_framing_header_except_length(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        match response.bytes().await {
            Ok(body) => ProxyResponse {
                status,
                headers,
                body: body.to_vec(),
            },
            Err(e) => ProxyResponse::error(502, format!("Bad Gateway - failed to read upstream body: {e}")),
        }
    }
}
