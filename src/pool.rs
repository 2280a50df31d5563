use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::http::head::HeaderList;

type RouteKey = (String, u16);

/// Owned by the pool, leased for one request, returned on response
/// completion or failure (spec.md §3 `PooledConnection`).
pub struct PooledConnection {
    pub stream: TcpStream,
    last_used: Instant,
    expires_at: Instant,
}

/// Pools upstream TCP connections keyed by `(proxyHost, proxyPort)`
/// with idle/expired eviction (spec.md §4.6). Internally synchronized
/// via `DashMap`, so it can be shared across every outbound request
/// through an `Arc` without an external lock.
pub struct ConnectionPool {
    buckets: DashMap<RouteKey, VecDeque<PooledConnection>>,
    max_total: Option<usize>,
    max_per_route: Option<usize>,
    max_connection_idle: Duration,
    leased: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(max_total: Option<usize>, max_per_route: Option<usize>, max_connection_idle: Duration) -> Self {
        ConnectionPool {
            buckets: DashMap::new(),
            max_total,
            max_per_route,
            max_connection_idle,
            leased: AtomicUsize::new(0),
        }
    }

    /// Pops a still-live connection for `route`, if one is pooled.
    /// Expired connections encountered along the way are dropped, not
    /// returned.
    pub fn acquire(&self, route: &RouteKey) -> Option<PooledConnection> {
        let mut bucket = self.buckets.get_mut(route)?;
        let now = Instant::now();
        while let Some(conn) = bucket.pop_back() {
            if conn.expires_at > now && now.duration_since(conn.last_used) <= self.max_connection_idle {
                self.leased.fetch_add(1, Ordering::Relaxed);
                return Some(conn);
            }
            debug!("dropping expired pooled connection for {:?}", route);
        }
        None
    }

    /// Leases the connection back into the pool under `keep_alive_ms`
    /// (spec.md §4.6 keep-alive duration law). Drops the connection
    /// instead of pooling it if the route is already at its per-route
    /// cap or the pool is at its global cap.
    pub fn release(&self, route: &RouteKey, stream: TcpStream, keep_alive_ms: u64) {
        self.leased.fetch_sub(1, Ordering::Relaxed);
        let mut bucket = self.buckets.entry(route.clone()).or_default();

        if let Some(cap) = self.max_per_route {
            if bucket.len() >= cap {
                return;
            }
        }
        if let Some(cap) = self.max_total {
            let total: usize = self.buckets.iter().map(|b| b.len()).sum();
            if total >= cap {
                return;
            }
        }

        let now = Instant::now();
        bucket.push_back(PooledConnection {
            stream,
            last_used: now,
            expires_at: now + Duration::from_millis(keep_alive_ms),
        });
    }

    /// Number of connections currently sitting idle in the pool
    /// (spec.md §8 property 6 / scenario S6).
    pub fn idle_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Sweep pass: (a) drop expired connections, (b) drop connections
    /// idle longer than `max_connection_idle`.
    fn evict_once(&self) {
        let now = Instant::now();
        let mut total_dropped = 0usize;
        for mut bucket in self.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|conn| conn.expires_at > now && now.duration_since(conn.last_used) <= self.max_connection_idle);
            total_dropped += before - bucket.len();
        }
        if total_dropped > 0 {
            debug!("eviction sweep dropped {} idle/expired connections", total_dropped);
        }
    }

    pub fn shutdown(&self) {
        self.buckets.clear();
    }
}

/// Computes the keep-alive duration from a response's `Keep-Alive`
/// header, or the configured default (spec.md §3/§4.6/§8 property 4).
pub fn keep_alive_duration_ms(headers: &HeaderList, max_connection_idle_secs: u64) -> u64 {
    let default_ms = max_connection_idle_secs * 1000;
    let Some((_, value)) = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("keep-alive")) else {
        return default_ms;
    };
    for element in value.split(',') {
        let element = element.trim();
        if let Some(rest) = element.strip_prefix("timeout=") {
            if let Ok(secs) = rest.trim().parse::<u64>() {
                return secs * 1000;
            }
        }
    }
    default_ms
}

/// Periodic task closing expired / overly idle pooled connections
/// (spec.md §4.6). `shutdown` cancels it by aborting the handle.
pub struct EvictionTimer {
    handle: JoinHandle<()>,
}

impl EvictionTimer {
    pub fn spawn(pool: std::sync::Arc<ConnectionPool>, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                pool.evict_once();
            }
        });
        EvictionTimer { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}
