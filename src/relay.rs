use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::SystemConfig;
use crate::error::ProxyError;
use crate::hop::{is_hop_by_hop, UpstreamRoute};
use crate::http::body::StreamingRequestBody;
use crate::http::head::{self, HeaderList, RequestHead, ResponseHead};
use crate::ntlm::{NtlmCredentials, NtlmNegotiator};
use crate::pool::{keep_alive_duration_ms, ConnectionPool};

/// Upper bound on NTLM rounds per relayed request, guarding against an
/// upstream that never settles on success or a terminal refusal
/// (spec.md §4.4/§4.5 describe a bounded handshake, not an unbounded
/// one).
const MAX_AUTH_ROUNDS: usize = 6;

fn configure_socket(stream: &TcpStream, buffer_size: usize) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);
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

fn forwarded_headers(request: &RequestHead, authorization: Option<&str>) -> HeaderList {
    let mut headers: HeaderList = request
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .cloned()
        .collect();
    headers.push(("Proxy-Connection".to_string(), "Keep-Alive".to_string()));
    if let Some(auth) = authorization {
        headers.push(("Proxy-Authorization".to_string(), auth.to_string()));
    }
    headers
}

/// Builds an upstream request mirroring the client's method, URI,
/// version and headers (minus hop-by-hop, spec.md §4.5), runs it
/// through the NTLM handshake (C1) over a pooled or freshly opened
/// connection (C6), and streams the final response status line,
/// headers, and body back through the CRLF framer (C2). Hop-by-hop
/// headers are stripped from the upstream response the same way.
///
/// Errors map to 502 Bad Gateway when no response byte has yet reached
/// `client_out`; once writing has begun, failures are reported to the
/// caller but the client has already seen a (possibly partial)
/// response, matching spec.md §4.5/§7.
pub async fn relay<W: AsyncWrite + Unpin>(
    route: &UpstreamRoute,
    request: &RequestHead,
    body: &mut StreamingRequestBody,
    credentials: NtlmCredentials,
    system: &SystemConfig,
    pool: &Arc<ConnectionPool>,
    client_out: &mut W,
) -> Result<(), ProxyError> {
    let route_key = route.pool_key();
    let stream = match pool.acquire(&route_key) {
        Some(conn) => conn.stream,
        None => open_connection(&route.proxy_host, route.proxy_port, system.socket_buffer_size).await?,
    };
    let mut conn = BufReader::new(stream);

    let mut negotiator = NtlmNegotiator::new(credentials);
    let mut body_sent_once = false;
    let mut rounds = 0usize;

    let final_response = loop {
        rounds += 1;
        if rounds > MAX_AUTH_ROUNDS {
            return Err(ProxyError::AuthExhausted);
        }

        let authorization = negotiator.pending_authorization()?;
        if authorization.is_some() && body_sent_once && !body.repeatable() {
            // The upstream wants another round but we've already
            // streamed a non-repeatable body once: replaying it would
            // corrupt the upstream's view of the entity. Give up
            // rather than send a malformed retry.
            return Err(ProxyError::AuthExhausted);
        }
        negotiator.mark_sent();

        let start_line = head::request_start_line(request);
        let headers = forwarded_headers(request, authorization.as_deref());
        head::write_head(&mut conn, &start_line, &headers)
            .await
            .map_err(ProxyError::UpstreamIo)?;
        body.write_to(&mut conn).await?;
        body_sent_once = true;

        let response = head::parse_response_head(&mut conn).await?;

        let has_challenge = response
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("proxy-authenticate"));

        if (200..300).contains(&response.status) && !has_challenge {
            break response;
        }

        let should_continue = negotiator.process_response(response.status, &response.headers);
        if !should_continue {
            // Either Success (2xx, already handled above) or a
            // terminal Failure. A terminal Failure here is not
            // necessarily an auth problem: a plain 404/500 with no
            // Proxy-Authenticate header also lands here, and is a
            // legitimate final answer to relay verbatim.
            break response;
        }

        head::read_body(&mut conn, &response)
            .await
            .map_err(ProxyError::UpstreamIo)?;
    };

    stream_response_to_client(client_out, &final_response, &mut conn).await?;

    let keep_alive_ms = keep_alive_duration_ms(&final_response.headers, system.max_connection_idle_secs);
    if final_response.is_keep_alive() {
        let stream = conn.into_inner();
        pool.release(&route_key, stream, keep_alive_ms);
    } else {
        debug!("upstream closed connection to {:?}, not returning it to the pool", route_key);
    }

    Ok(())
}

/// Writes the final status line, headers (hop-by-hop stripped), and
/// body to the client. The body is copied byte-for-byte: fully when
/// Content-Length is known, until EOF otherwise (the upstream
/// connection's closure is itself the end-of-body signal in that
/// case, same as `StreamingRequestBody`'s unknown-length path).
async fn stream_response_to_client<W: AsyncWrite + Unpin, R: tokio::io::AsyncRead + Unpin>(
    client_out: &mut W,
    response: &ResponseHead,
    upstream: &mut R,
) -> Result<(), ProxyError> {
    use tokio::io::AsyncReadExt;

    let start_line = head::response_start_line(response);
    let headers: HeaderList = response
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .cloned()
        .collect();
    head::write_head(client_out, &start_line, &headers)
        .await
        .map_err(ProxyError::UpstreamIo)?;

    let content_length = response.content_length();
    if content_length >= 0 {
        let mut limited = upstream.take(content_length as u64);
        tokio::io::copy(&mut limited, client_out).await.map_err(ProxyError::UpstreamIo)?;
    } else {
        tokio::io::copy(upstream, client_out).await.map_err(ProxyError::UpstreamIo)?;
    }
    client_out.flush().await.map_err(ProxyError::UpstreamIo)
}
