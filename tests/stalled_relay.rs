//! A relay that accepts the connection but never reads from it.

mod common;

use std::time::Duration;

use common::{exchange, FakeRelay};
use froxy::EdgeProxy;

const UPLOAD_BYTES: usize = 9 * 1024 * 1024;

fn upload_request() -> String {
    format!(
        "POST http://files.hospital.local/upload HTTP/1.1\r\nHost: files.hospital.local\r\nContent-Length: {UPLOAD_BYTES}\r\n\r\n{}",
        "a".repeat(UPLOAD_BYTES)
    )
}

fn stalled_config(relay_url: &str) -> froxy::Config {
    let mut config = common::config(relay_url);
    config.edge.domain_filter = "hospital.local".to_string();
    config.edge.max_body_bytes = 16 * 1024 * 1024;
    config
}

#[tokio::test]
async fn stop_is_bounded_when_relay_stops_reading() {
    let mut relay = FakeRelay::start().await;
    let edge = EdgeProxy::start(&stalled_config(&relay.url)).await.unwrap();
    // Held open, never polled: writes back up once the socket buffers fill.
    let _peer = relay.next_peer().await;

    let request = upload_request();
    let callers: Vec<_> = (0..4)
        .map(|_| tokio::spawn({
            let request = request.clone();
            let addr = edge.local_addr();
            async move { exchange(addr, &request).await }
        }))
        .collect();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let started = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(5), edge.stop())
        .await
        .expect("stop did not return");
    assert!(started.elapsed() < Duration::from_secs(5));

    for caller in callers {
        let response = caller.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 50"), "{response}");
    }
}

#[tokio::test]
async fn stalled_write_counts_against_the_relay_timeout() {
    let mut relay = FakeRelay::start().await;
    let mut config = stalled_config(&relay.url);
    config.edge.relay_timeout_secs = 1;
    let edge = EdgeProxy::start(&config).await.unwrap();
    let _peer = relay.next_peer().await;

    let request = upload_request();
    let started = tokio::time::Instant::now();
    let callers: Vec<_> = (0..4)
        .map(|_| tokio::spawn({
            let request = request.clone();
            let addr = edge.local_addr();
            async move { exchange(addr, &request).await }
        }))
        .collect();

    for caller in callers {
        let response = caller.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"), "{response}");
    }
    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(edge.sessions().is_empty().await);

    edge.stop().await;
}
