use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::AsyncReadExt as _;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::bridge;
use crate::config::{SystemConfig, UserConfig};
use crate::credentials::CredentialsStore;
use crate::error::ProxyError;
use crate::hop::UpstreamRoute;
use crate::http::body::StreamingRequestBody;
use crate::http::head::{self, RequestHead};
use crate::pool::{ConnectionPool, EvictionTimer};
use crate::relay::relay;
use crate::tunnel::{credentials_from_provider, tunnel};

const STATE_NEW: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Everything a connection worker needs, cloned cheaply (`Arc` fields)
/// into every spawned task — mirrors the teacher's own
/// `#[derive(Clone)] struct Proxy` shape in `proxy.rs`.
#[derive(Clone)]
struct Shared {
    user: Arc<UserConfig>,
    system: Arc<SystemConfig>,
    credentials: Arc<CredentialsStore>,
    pool: Arc<ConnectionPool>,
}

/// Accepts client sockets and dispatches each to its own tokio task
/// (spec.md §4.7). Lifecycle is `NEW → STARTED → CLOSED`; `close()` is
/// idempotent and frees the bound port by dropping the listener.
pub struct Server {
    shared: Shared,
    state: AtomicU8,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    eviction: Mutex<Option<EvictionTimer>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(user: UserConfig, system: SystemConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(
            system.max_connections,
            system.max_connections_per_route,
            Duration::from_secs(system.max_connection_idle_secs),
        ));
        Server {
            shared: Shared {
                user: Arc::new(user),
                system: Arc::new(system),
                credentials: Arc::new(CredentialsStore::new()),
                pool,
            },
            state: AtomicU8::new(STATE_NEW),
            accept_task: Mutex::new(None),
            eviction: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// spec.md §4.7 `start()`: fails with `IllegalState` if already
    /// started (or closed). Validates credentials before opening any
    /// socket (spec.md §4.1), then binds the listener, starts the
    /// eviction timer (if enabled), and begins accepting connections
    /// on a background task.
    pub async fn start(&self) -> Result<(), ProxyError> {
        if self
            .state
            .compare_exchange(STATE_NEW, STATE_STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProxyError::IllegalState("server already started or closed".into()));
        }

        self.shared.credentials.get(&self.shared.user)?;

        let addr: SocketAddr = ([0, 0, 0, 0], self.shared.user.local_port).into();
        let listener = TcpListener::bind(addr).await.map_err(ProxyError::UpstreamIo)?;
        let bound_addr = listener.local_addr().map_err(ProxyError::UpstreamIo)?;
        info!("Listening on {bound_addr}, forwarding through {}:{}", self.shared.user.proxy_host, self.shared.user.proxy_port);

        *self.local_addr.lock().await = Some(bound_addr);

        if self.shared.system.eviction_enabled {
            let timer = EvictionTimer::spawn(
                self.shared.pool.clone(),
                Duration::from_secs(self.shared.system.eviction_period_secs),
            );
            *self.eviction.lock().await = Some(timer);
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { accept_loop(listener, shared).await });
        *self.accept_task.lock().await = Some(handle);

        Ok(())
    }

    /// spec.md §4.7 `close()`: closes the server socket (freeing the
    /// bound port), tears down the eviction timer, and clears the
    /// pool. Idempotent — a second call is a no-op, not an error.
    pub async fn close(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }
        if let Some(timer) = self.eviction.lock().await.take() {
            timer.stop();
        }
        self.shared.pool.shutdown();
        *self.local_addr.lock().await = None;
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Runs until a fatal accept-loop error or Ctrl-C, whichever comes
    /// first (kept from the teacher's `run()`, SPEC_FULL.md §B).
    pub async fn run(&self) -> Result<(), ProxyError> {
        self.start().await?;
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, closing.");
        self.close().await;
        Ok(())
    }
}

fn configure_accepted_socket(stream: &TcpStream, buffer_size: usize) -> std::io::Result<()> {
    let sock_ref = SockRef::from(stream);
    sock_ref.set_nodelay(true)?;
    sock_ref.set_send_buffer_size(buffer_size)?;
    sock_ref.set_recv_buffer_size(buffer_size)?;
    Ok(())
}

async fn accept_loop(listener: TcpListener, shared: Shared) {
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("failed to accept connection: {e}");
                continue;
            }
        };

        if let Err(e) = configure_accepted_socket(&socket, shared.system.server_socket_buffer_size) {
            warn!("failed to configure accepted socket from {peer_addr}: {e}");
            continue;
        }

        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, &shared).await {
                error!("connection from {peer_addr} ended with error: {e}");
            }
        });
    }
}

/// Parses the request head and dispatches: `CONNECT` goes through
/// `TunnelNegotiator` + `SocketBridge`; every other method goes
/// through `RelayHandler` (spec.md §2 control flow).
///
/// The head is parsed through a `tokio::io::BufReader`, which refills
/// its buffer from the socket in whole chunks — for a client that sends
/// head and body in the same TCP segment (the common case), the start
/// of the body is already sitting in that buffer once the head is
/// parsed. The read/write halves are split up front so that buffered
/// prefix can be threaded into the body reader as an owned value
/// (`StreamingRequestBody` needs `'static` to box its non-repeatable
/// path) instead of being dropped by `BufReader::into_inner()`.
async fn handle_connection(socket: TcpStream, shared: &Shared) -> Result<(), ProxyError> {
    let (read_half, write_half) = socket.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);
    let request = head::parse_request_head(&mut reader).await?;

    let provider = shared.credentials.get(&shared.user)?;
    let credentials = credentials_from_provider(provider);

    if request.method.eq_ignore_ascii_case("CONNECT") {
        let read_half = reader.into_inner();
        let client = read_half.reunite(write_half).map_err(|e| {
            ProxyError::UpstreamIo(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        handle_connect(client, &request, credentials, shared).await
    } else {
        let leftover = reader.buffer().to_vec();
        let read_half = reader.into_inner();
        let body_source = std::io::Cursor::new(leftover).chain(read_half);
        handle_relay(body_source, write_half, &request, credentials, shared).await
    }
}

fn parse_connect_target(target: &str) -> Result<(String, i32), ProxyError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::MalformedRequest(format!("malformed CONNECT target: {target:?}")))?;
    let port: i32 = port
        .parse()
        .map_err(|_| ProxyError::MalformedRequest(format!("malformed CONNECT target port: {target:?}")))?;
    Ok((host.to_string(), port))
}

async fn handle_connect(
    mut client: TcpStream,
    request: &RequestHead,
    credentials: crate::ntlm::NtlmCredentials,
    shared: &Shared,
) -> Result<(), ProxyError> {
    use tokio::io::AsyncWriteExt as _;

    let (target_host, target_port) = parse_connect_target(&request.target)?;
    let route = UpstreamRoute::new(
        target_host,
        target_port,
        shared.user.proxy_host.clone(),
        shared.user.proxy_port,
        true,
    );

    match tunnel(&route, &request.version, credentials, &shared.system, &mut client).await {
        Ok(handle) => bridge(client, handle).await,
        Err(e) => {
            if let Some((status, reason)) = e.downstream_status() {
                let mut headers = Vec::new();
                if let Some(auth) = e.proxy_authenticate() {
                    headers.push(("Proxy-Authenticate".to_string(), auth.to_string()));
                }
                let start_line = format!("{} {status} {reason}", request.version);
                let _ = head::write_head(&mut client, &start_line, &headers).await;
            }
            Err(e)
        }
    }
}

async fn handle_relay<R>(
    body_source: R,
    mut client_out: OwnedWriteHalf,
    request: &RequestHead,
    credentials: crate::ntlm::NtlmCredentials,
    shared: &Shared,
) -> Result<(), ProxyError>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let (target_host, target_port) = target_from_relay_request(request)?;
    let route = UpstreamRoute::new(
        target_host,
        target_port,
        shared.user.proxy_host.clone(),
        shared.user.proxy_port,
        false,
    );

    let content_length = request.content_length();
    let mut body = StreamingRequestBody::new(body_source, content_length)
        .await
        .map_err(ProxyError::UpstreamIo)?;

    relay(&route, request, &mut body, credentials, &shared.system, &shared.pool, &mut client_out).await
}

/// Non-tunnelled requests carry an absolute-URI request-target
/// (`http://host[:port]/path`); the upstream proxy is always reached
/// at `UserConfig.proxy_host`/`proxy_port`, but the *target* host/port
/// embedded in the URI still matters for the pool's per-route key.
fn target_from_relay_request(request: &RequestHead) -> Result<(String, i32), ProxyError> {
    let target = &request.target;
    let without_scheme = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target.as_str());
    let authority = without_scheme.split(['/', '?', '#']).next().unwrap_or(without_scheme);
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            let port: i32 = port
                .parse()
                .map_err(|_| ProxyError::MalformedRequest(format!("malformed request target: {target:?}")))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((authority.to_string(), 80)),
    }
}
