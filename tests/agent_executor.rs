//! Agent executor against local HTTP targets.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::spawn_http_target;
use froxy::config::AgentConfig;
use froxy::{Executor, RelayMessage};

fn executor(allowed: &str, timeout_secs: u64) -> Executor {
    Executor::new(&AgentConfig {
        allowed_domains: allowed.to_string(),
        request_timeout_secs: timeout_secs,
        ..AgentConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn get_returns_status_headers_and_body() {
    let target = spawn_http_target(|head, _| format!("{} {}", head.method, head.target)).await;
    let request = RelayMessage::request("s-get", "GET", format!("http://{target}/status?x=1"), HashMap::new(), None);

    let reply = executor("127.0.0.1", 5).execute(request).await;
    assert_eq!(reply.session_id.as_deref(), Some("s-get"));
    assert_eq!(reply.status_code, Some(200));
    assert_eq!(reply.body.as_deref(), Some("GET /status?x=1"));
    assert_eq!(reply.header("x-upstream"), Some("yes"));
    assert!(reply.error.is_none());
}

#[tokio::test]
async fn post_body_defaults_to_json_content_type() {
    let target = spawn_http_target(|head, body| {
        format!(
            "{}|{}",
            head.header("content-type").unwrap_or("-"),
            String::from_utf8_lossy(body)
        )
    })
    .await;
    let request = RelayMessage::request(
        "s-post",
        "POST",
        format!("http://{target}/api"),
        HashMap::new(),
        Some(r#"{"a":1}"#.to_string()),
    );

    let reply = executor("", 5).execute(request).await;
    assert_eq!(reply.status_code, Some(200));
    assert_eq!(reply.body.as_deref(), Some(r#"application/json|{"a":1}"#));
}

#[tokio::test]
async fn forwarded_headers_skip_host_and_length() {
    let target = spawn_http_target(|head, _| {
        format!(
            "{}|{}|{}",
            head.header("x-custom").unwrap_or("-"),
            head.header("host").unwrap_or("-"),
            head.header("content-type").unwrap_or("-"),
        )
    })
    .await;
    let headers = HashMap::from([
        ("X-Custom".to_string(), "42".to_string()),
        ("Host".to_string(), "spoofed.example".to_string()),
        ("Content-Length".to_string(), "9999".to_string()),
        ("Content-Type".to_string(), "text/csv".to_string()),
    ]);
    let request = RelayMessage::request(
        "s-h",
        "PUT",
        format!("http://{target}/"),
        headers,
        Some("a,b".to_string()),
    );

    let reply = executor("", 5).execute(request).await;
    assert_eq!(reply.status_code, Some(200));
    assert_eq!(reply.body.unwrap(), format!("42|{target}|text/csv"));
}

#[tokio::test]
async fn connection_refused_is_500() {
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let request = RelayMessage::request("s-down", "GET", format!("http://{closed}/"), HashMap::new(), None);

    let reply = executor("", 5).execute(request).await;
    assert_eq!(reply.session_id.as_deref(), Some("s-down"));
    assert_eq!(reply.status_code, Some(500));
    assert!(reply.error.unwrap().contains(&closed.to_string()));
}

#[tokio::test]
async fn silent_upstream_times_out_with_500() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    let request = RelayMessage::request("s-slow", "GET", format!("http://{addr}/"), HashMap::new(), None);

    let started = tokio::time::Instant::now();
    let reply = executor("", 1).execute(request).await;
    assert_eq!(reply.status_code, Some(500));
    assert!(reply.error.unwrap().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cidr_allow_list() {
    let exec = executor("10.0.0.0/8", 5);
    let blocked = RelayMessage::request("s", "GET", "http://192.168.1.5/", HashMap::new(), None);
    assert_eq!(exec.execute(blocked).await.status_code, Some(403));
}

#[tokio::test]
async fn accept_encoding_is_not_forwarded() {
    let target = spawn_http_target(|head, _| {
        format!("accept-encoding={:?}", head.header("accept-encoding"))
    })
    .await;
    let headers = HashMap::from([
        ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
        ("Accept".to_string(), "text/html".to_string()),
    ]);
    let request = RelayMessage::request("s-gz", "GET", format!("http://{target}/page"), headers, None);

    let reply = executor("", 5).execute(request).await;
    assert_eq!(reply.status_code, Some(200));
    assert_eq!(reply.body.as_deref(), Some("accept-encoding=None"));
    assert!(reply.header("content-encoding").is_none());
}

#[tokio::test]
async fn bodiless_post_gets_no_content_type() {
    let target = spawn_http_target(|head, body| {
        format!("{}|{}", head.header("content-type").unwrap_or("-"), body.len())
    })
    .await;
    let exec = executor("", 5);

    let no_body = RelayMessage::request("s-nb", "POST", format!("http://{target}/"), HashMap::new(), None);
    let reply = exec.execute(no_body).await;
    assert_eq!(reply.status_code, Some(200));
    assert_eq!(reply.body.as_deref(), Some("-|0"));

    let empty_body = RelayMessage::request(
        "s-eb",
        "PATCH",
        format!("http://{target}/"),
        HashMap::new(),
        Some(String::new()),
    );
    let reply = exec.execute(empty_body).await;
    assert_eq!(reply.body.as_deref(), Some("-|0"));
}
