/// Headers whose scope is a single transport connection and which
/// MUST NOT be forwarded verbatim through a proxy (spec.md §3, §4.5,
/// GLOSSARY). Compared case-insensitively against wire header names.
pub const HOP_BY_HOP: &[&str] = &[
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// spec.md §3: `(targetHost, targetPort, proxyHost, proxyPort, tunnelled?)`.
/// Port ≤ 0 normalizes to 80; since ports are represented as `u16`
/// here, a literal `0` is the only representable "≤ 0" input and is
/// normalized the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamRoute {
    pub target_host: String,
    pub target_port: u16,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub tunnelled: bool,
}

impl UpstreamRoute {
    pub fn new(target_host: String, target_port: i32, proxy_host: String, proxy_port: u16, tunnelled: bool) -> Self {
        let target_port = if target_port <= 0 { 80 } else { target_port as u16 };
        UpstreamRoute {
            target_host,
            target_port,
            proxy_host,
            proxy_port,
            tunnelled,
        }
    }

    /// Route key used to partition the connection pool — all requests
    /// to the same target through the same upstream proxy share a pool
    /// bucket (spec.md §4.6).
    pub fn pool_key(&self) -> (String, u16) {
        (self.proxy_host.clone(), self.proxy_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_negative_port_normalizes_to_80() {
        let r = UpstreamRoute::new("example.com".into(), 0, "proxy".into(), 8080, true);
        assert_eq!(r.target_port, 80);
        let r = UpstreamRoute::new("example.com".into(), -1, "proxy".into(), 8080, true);
        assert_eq!(r.target_port, 80);
    }

    #[test]
    fn positive_port_preserved() {
        let r = UpstreamRoute::new("example.com".into(), 443, "proxy".into(), 8080, true);
        assert_eq!(r.target_port, 443);
    }

    #[test]
    fn hop_by_hop_matches_case_insensitively() {
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(is_hop_by_hop("KEEP-ALIVE"));
        assert!(!is_hop_by_hop("Content-Length"));
    }
}
