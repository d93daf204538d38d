//! CONNECT tunnels. Always dialed directly, never through the relay.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::response::ProxyResponse;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Dial `host:port`, answer `200 Connection Established` and splice bytes in
/// both directions until either side closes or the proxy stops.
///
/// `early` holds bytes the caller sent after the CONNECT head; they are
/// delivered to the target first.
pub async fn tunnel(
    mut client: TcpStream,
    host: &str,
    port: u16,
    early: Vec<u8>,
    dial_timeout: Duration,
    token: &CancellationToken,
) {
    let dial = tokio::time::timeout(dial_timeout, TcpStream::connect((host, port))).await;
    let mut upstream = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Tunnel: connect to {host}:{port} failed: {e}");
            let response = ProxyResponse::error(502, format!("Bad Gateway - cannot reach {host}:{port}: {e}"));
            let _ = response.write_to(&mut client, false).await;
            return;
        }
        Err(_) => {
            warn!("Tunnel: connect to {host}:{port} timed out after {}s", dial_timeout.as_secs());
            let response = ProxyResponse::error(504, format!("Gateway Timeout - no answer from {host}:{port}"));
            let _ = response.write_to(&mut client, false).await;
            return;
        }
    };
    let _ = upstream.set_nodelay(true);

    if let Err(e) = client.write_all(ESTABLISHED).await {
        debug!("Tunnel: caller went away before establishment: {e}");
        return;
    }
    if !early.is_empty() {
        if let Err(e) = upstream.write_all(&early).await {
            debug!("Tunnel: failed to forward early bytes: {e}");
            return;
        }
    }
    info!("Tunnel: established to {host}:{port}");

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => match result {
            Ok((up, down)) => info!(up, down, "Tunnel: {host}:{port} closed"),
            Err(e) => debug!("Tunnel: {host}:{port} ended with error: {e}"),
        },
        () = token.cancelled() => debug!("Tunnel: {host}:{port} cancelled"),
    }
}
