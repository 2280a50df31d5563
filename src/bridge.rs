use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::tunnel::TunnelHandle;

/// Bidirectionally pumps bytes between an established CONNECT tunnel
/// and the client that asked for it (spec.md §4.4 step 6, GLOSSARY
/// "SocketBridge"). Each direction runs on its own spawned task rather
/// than a single `copy_bidirectional` future, so a stall or half-close
/// in one direction never blocks the other. Any bytes the upstream
/// already sent immediately after its CONNECT success line
/// (`handle.leftover`) are flushed to the client before the pump
/// starts, so nothing read ahead during negotiation is lost.
pub async fn bridge(client: TcpStream, handle: TunnelHandle) -> Result<(), ProxyError> {
    let TunnelHandle { socket: upstream, leftover } = handle;

    let (client_read, mut client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    if !leftover.is_empty() {
        client_write.write_all(&leftover).await.map_err(ProxyError::UpstreamIo)?;
    }

    let client_to_upstream = tokio::spawn(async move {
        let mut client_read = client_read;
        let mut upstream_write = upstream_write;
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        result
    });

    let upstream_to_client = tokio::spawn(async move {
        let mut upstream_read = upstream_read;
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    });

    let (c2u, u2c) = tokio::join!(client_to_upstream, upstream_to_client);

    match (c2u, u2c) {
        (Ok(Ok(sent)), Ok(Ok(received))) => {
            debug!("tunnel closed: {sent} bytes client->upstream, {received} bytes upstream->client");
            Ok(())
        }
        (Ok(Err(e)), _) | (_, Ok(Err(e))) => {
            warn!("tunnel bridge I/O error: {e}");
            Err(ProxyError::UpstreamIo(e))
        }
        (Err(join_err), _) | (_, Err(join_err)) => {
            warn!("tunnel bridge task panicked: {join_err}");
            Err(ProxyError::UpstreamProtocol(format!("bridge task failed: {join_err}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn leftover_bytes_are_flushed_before_the_pump_starts() {
        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let mut client = TcpStream::connect(client_addr).await.unwrap();
            let mut buf = [0u8; 5];
            client.read_exact(&mut buf).await.unwrap();
            buf
        });
        let (client_sock, _) = client_listener.accept().await.unwrap();

        let upstream_task = tokio::spawn(async move {
            let (mut upstream, _) = upstream_listener.accept().await.unwrap();
            // Give the bridge time to flush the leftover before anything
            // else arrives on this side.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            upstream.shutdown().await.ok();
        });
        let upstream_sock = TcpStream::connect(upstream_addr).await.unwrap();

        let handle = TunnelHandle {
            socket: upstream_sock,
            leftover: b"hello".to_vec(),
        };

        bridge(client_sock, handle).await.unwrap();
        let received = client_task.await.unwrap();
        assert_eq!(&received, b"hello");
        upstream_task.await.unwrap();
    }
}
