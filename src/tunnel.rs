use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::SystemConfig;
use crate::error::ProxyError;
use crate::http::head::{self, HeaderList};
use crate::hop::UpstreamRoute;
use crate::ntlm::{NtlmCredentials, NtlmNegotiator};

/// Result of a successful tunnel negotiation: the raw upstream socket,
/// handed off for byte-level bridging, plus any bytes the upstream
/// already sent immediately after the CONNECT success line (read
/// ahead by our buffered reader and not yet delivered downstream).
pub struct TunnelHandle {
    pub socket: TcpStream,
    pub leftover: Vec<u8>,
}

fn configure_socket(stream: &TcpStream, buffer_size: usize) -> std::io::Result<()> {
    let sock_ref = SockRef::from(stream);
    sock_ref.set_nodelay(true)?;
    sock_ref.set_send_buffer_size(buffer_size)?;
    sock_ref.set_recv_buffer_size(buffer_size)?;
    Ok(())
}

async fn open_connection(proxy_host: &str, proxy_port: u16, buffer_size: usize) -> Result<TcpStream, ProxyError> {
    let stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(ProxyError::UpstreamIo)?;
    configure_socket(&stream, buffer_size).map_err(ProxyError::UpstreamIo)?;
    Ok(stream)
}

fn build_connect_request(route: &UpstreamRoute, version: &str, authorization: Option<&str>) -> (String, HeaderList) {
    let target = format!("{}:{}", route.target_host, route.target_port);
    let start_line = format!("CONNECT {target} {version}");
    let mut headers = vec![
        ("Host".to_string(), target.clone()),
        ("Proxy-Connection".to_string(), "Keep-Alive".to_string()),
        ("User-Agent".to_string(), "ntlm-proxy/0.1".to_string()),
    ];
    if let Some(auth) = authorization {
        headers.push(("Proxy-Authorization".to_string(), auth.to_string()));
    }
    (start_line, headers)
}

/// Opens a TCP socket to the upstream proxy and loops CONNECT + NTLM
/// challenge-response until success or terminal failure (spec.md
/// §4.4). On success, the CRLF-framed status line and every response
/// header are written to `client_out`; write failures there are
/// tolerated (logged at debug only) since clients often close the
/// socket immediately upon seeing the status line for an error tunnel
/// (spec.md §4.2, §9).
pub async fn tunnel<W: AsyncWriteExt + Unpin>(
    route: &UpstreamRoute,
    protocol_version: &str,
    credentials: NtlmCredentials,
    system: &SystemConfig,
    client_out: &mut W,
) -> Result<TunnelHandle, ProxyError> {
    let mut negotiator = NtlmNegotiator::new(credentials);
    let mut conn: Option<BufReader<TcpStream>> = None;

    let final_response = loop {
        if conn.is_none() {
            let stream = open_connection(&route.proxy_host, route.proxy_port, system.socket_buffer_size).await?;
            conn = Some(BufReader::new(stream));
        }
        let authorization = negotiator.pending_authorization()?;
        negotiator.mark_sent();
        let (start_line, headers) = build_connect_request(route, protocol_version, authorization.as_deref());
        {
            let stream = conn.as_mut().expect("just ensured present");
            head::write_head(stream, &start_line, &headers)
                .await
                .map_err(ProxyError::UpstreamIo)?;
        }

        let response = {
            let stream = conn.as_mut().expect("just ensured present");
            head::parse_response_head(stream).await?
        };

        if response.status < 200 {
            return Err(ProxyError::UpstreamProtocol(format!(
                "upstream sent non-negotiable status {}",
                response.status
            )));
        }

        let has_challenge = response
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("proxy-authenticate"));

        if (200..300).contains(&response.status) && !has_challenge {
            break response;
        }

        let should_continue = negotiator.process_response(response.status, &response.headers);
        if !should_continue {
            break response;
        }

        if response.is_keep_alive() {
            let stream = conn.as_mut().expect("just ensured present");
            head::read_body(stream, &response)
                .await
                .map_err(ProxyError::UpstreamIo)?;
        } else {
            conn = None;
        }
    };

    if !(200..300).contains(&final_response.status) {
        let mut body = Vec::new();
        if let Some(stream) = conn.as_mut() {
            body = head::read_body(stream, &final_response).await.unwrap_or_default();
        }
        return Err(ProxyError::TunnelRefused {
            status: final_response.status,
            reason: final_response.reason.clone(),
            headers: final_response.headers.clone(),
            body,
        });
    }

    let start_line = head::response_start_line(&final_response);
    if let Err(e) = head::write_head(client_out, &start_line, &final_response.headers).await {
        debug!("failed to write tunnel status line to client, continuing anyway: {e}");
    }

    let mut buf_stream = conn.expect("success implies an open connection");
    let leftover = buf_stream.buffer().to_vec();
    let socket = buf_stream.into_inner();
    Ok(TunnelHandle { socket, leftover })
}

/// Per-CONNECT-attempt wait budget shared by the caller; kept separate
/// from the negotiation loop itself so tests can drive the protocol
/// without racing a real clock.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Convenience used by the server/relay layer: materializes
/// `NtlmCredentials` from the process-wide provider.
pub fn credentials_from_provider(provider: &crate::credentials::CredentialsProvider) -> NtlmCredentials {
    NtlmCredentials {
        username: provider.user.clone(),
        password: provider.password.clone(),
        domain: provider.domain.clone(),
        workstation: provider.workstation.clone(),
    }
}

pub type SharedSystemConfig = Arc<SystemConfig>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialsProvider;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    fn system_config() -> SystemConfig {
        SystemConfig {
            socket_buffer_size: 16 * 1024,
            server_socket_buffer_size: 16 * 1024,
            max_connections: None,
            max_connections_per_route: None,
            eviction_enabled: false,
            eviction_period_secs: 30,
            max_connection_idle_secs: 60,
            retries: false,
        }
    }

    fn provider() -> CredentialsProvider {
        CredentialsProvider {
            user: "alice".into(),
            password: "hunter2".into(),
            workstation: None,
            domain: Some("CORP".into()),
        }
    }

    fn sample_type2_base64() -> String {
        let mut type2 = vec![0u8; 56];
        type2[0..8].copy_from_slice(b"NTLMSSP\0");
        type2[8..12].copy_from_slice(&2u32.to_le_bytes());
        type2[20..24].copy_from_slice(&0x0000_0201u32.to_le_bytes());
        type2[24..32].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(type2)
    }

    #[tokio::test]
    async fn two_stage_ntlm_connect_succeeds_on_one_tcp_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = BufReader::new(&mut sock);

            // Round 1: bare CONNECT -> bare NTLM challenge.
            let _req = head::parse_request_head(&mut buf).await.unwrap();
            buf.get_mut()
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();

            // Round 2: Type-1 -> Type-2 challenge.
            let _req = head::parse_request_head(&mut buf).await.unwrap();
            let type2_b64 = sample_type2_base64();
            buf.get_mut()
                .write_all(
                    format!(
                        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM {type2_b64}\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();

            // Round 3: Type-3 -> success.
            let _req = head::parse_request_head(&mut buf).await.unwrap();
            buf.get_mut()
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();

            sock
        });

        let route = UpstreamRoute::new("example.com".into(), 443, addr.ip().to_string(), addr.port(), true);
        let system = system_config();
        let creds = credentials_from_provider(&provider());
        let mut client_out = Vec::new();

        let handle = tunnel(&route, "HTTP/1.1", creds, &system, &mut client_out).await.unwrap();
        assert!(client_out.starts_with(b"HTTP/1.1 200"));
        assert!(handle.leftover.is_empty());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_tunnel_is_not_handed_off() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = BufReader::new(&mut sock);
            let _req = head::parse_request_head(&mut buf).await.unwrap();
            buf.get_mut()
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 4\r\n\r\nnope")
                .await
                .unwrap();
        });

        let route = UpstreamRoute::new("example.com".into(), 443, addr.ip().to_string(), addr.port(), true);
        let system = system_config();
        let creds = credentials_from_provider(&provider());
        let mut client_out = Vec::new();

        let err = tunnel(&route, "HTTP/1.1", creds, &system, &mut client_out).await.unwrap_err();
        match err {
            ProxyError::TunnelRefused { status, body, .. } => {
                assert_eq!(status, 403);
                assert_eq!(body, b"nope");
            }
            other => panic!("expected TunnelRefused, got {other:?}"),
        }
        assert!(client_out.is_empty());

        server.await.unwrap();
    }
}
