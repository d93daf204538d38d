//! Shared fixtures: an in-process relay broker and tiny HTTP/TCP targets.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use froxy::config::Config;
use froxy::proxy::head::{read_body, read_head, RequestHead};
use froxy::{MessageType, RelayMessage};

pub const TOKEN: &str = "test-secret";

type Ws = WebSocketStream<TcpStream>;

/// Accepts relay clients and hands each one to the test.
pub struct FakeRelay {
    pub url: String,
    peers: mpsc::UnboundedReceiver<Peer>,
}

/// Server side of one relay client connection.
pub struct Peer {
    pub query: String,
    pub ws: Ws,
}

impl FakeRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, peers) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut query = String::new();
                let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
                    query = req.uri().query().unwrap_or_default().to_string();
                    Ok::<_, ErrorResponse>(resp)
                });
                let Ok(ws) = handshake.await else {
                    continue;
                };
                if tx.send(Peer { query, ws }).is_err() {
                    break;
                }
            }
        });

        Self { url, peers }
    }

    pub async fn next_peer(&mut self) -> Peer {
        tokio::time::timeout(Duration::from_secs(10), self.peers.recv())
            .await
            .expect("no relay client connected in time")
            .expect("relay listener stopped")
    }
}

impl Peer {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .split('&')
            .find_map(|kv| kv.strip_prefix(key)?.strip_prefix('='))
    }

    /// Next application message, skipping keepalive PINGs.
    pub async fn recv(&mut self) -> RelayMessage {
        loop {
            let msg = self.recv_any().await;
            if msg.kind != MessageType::Ping {
                return msg;
            }
        }
    }

    /// Next text message, keepalive included.
    pub async fn recv_any(&mut self) -> RelayMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), self.ws.next())
                .await
                .expect("no message from relay client in time");
            match frame {
                Some(Ok(Message::Text(text))) => return RelayMessage::decode(text.as_str()),
                Some(Ok(_)) => {}
                other => panic!("relay client stream ended: {other:?}"),
            }
        }
    }

    pub async fn send(&mut self, msg: &RelayMessage) {
        self.ws
            .send(Message::Text(msg.encode().unwrap().into()))
            .await
            .unwrap();
    }
}

/// Forward frames between two relay clients, like the real broker does.
pub fn pair(a: Peer, b: Peer) -> JoinHandle<()> {
    let (a_tx, a_rx) = a.ws.split();
    let (b_tx, b_rx) = b.ws.split();
    tokio::spawn(async move {
        tokio::join!(forward(a_rx, b_tx), forward(b_rx, a_tx));
    })
}

async fn forward(mut from: SplitStream<Ws>, mut to: SplitSink<Ws, Message>) {
    while let Some(Ok(msg)) = from.next().await {
        if msg.is_close() {
            let _ = to.close().await;
            break;
        }
        if (msg.is_text() || msg.is_binary()) && to.send(msg).await.is_err() {
            break;
        }
    }
}

/// Config pointing both sides at `relay_url`, with the edge on an ephemeral port.
pub fn config(relay_url: &str) -> Config {
    let mut config = Config::default();
    config.relay.url = relay_url.to_string();
    config.relay.token = TOKEN.to_string();
    config.relay.reconnect_delay_secs = 1;
    config.edge.listen = "127.0.0.1:0".to_string();
    config.lifecycle.shutdown_grace_ms = 1000;
    config
}

type Handler = Arc<dyn Fn(&RequestHead, &[u8]) -> String + Send + Sync>;

/// HTTP/1.1 server answering every request with `handler(head, body)` as a
/// `200 OK` text body.
pub async fn spawn_http_target(
    handler: impl Fn(&RequestHead, &[u8]) -> String + Send + Sync + 'static,
) -> SocketAddr {
    let handler: Handler = Arc::new(handler);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let Ok((head, early)) = read_head(&mut stream, 64 * 1024).await else {
                    return;
                };
                let length = head.content_length().unwrap_or(0);
                let Ok(body) = read_body(&mut stream, early, length, 1024 * 1024).await else {
                    return;
                };
                let text = handler(&head, &body);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Upstream: yes\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{text}",
                    text.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// TCP server echoing every byte back.
pub async fn spawn_echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Send one raw request to the proxy and read until it closes the connection.
pub async fn exchange(proxy: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(15), stream.read_to_end(&mut out))
        .await
        .expect("proxy did not answer in time")
        .unwrap();
    String::from_utf8_lossy(&out).into_owned()
}
