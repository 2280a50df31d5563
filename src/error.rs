use thiserror::Error;

/// Error taxonomy from spec.md §7. Each variant carries what the
/// propagation policy in §7 needs to build a downstream HTTP response
/// (or decide there's nothing left to do but drop the socket).
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("upstream I/O error: {0}")]
    UpstreamIo(#[from] std::io::Error),

    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("tunnel refused: {status} {reason}")]
    TunnelRefused {
        status: u16,
        reason: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },

    #[error("NTLM authentication exhausted without success")]
    AuthExhausted,

    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl ProxyError {
    /// Status line + headers §7 says to send downstream before any
    /// response byte has been written, or `None` if this kind has no
    /// sensible direct mapping (the caller must just drop the socket).
    pub fn downstream_status(&self) -> Option<(u16, &'static str)> {
        match self {
            ProxyError::MalformedRequest(_) => Some((400, "Bad Request")),
            ProxyError::UpstreamIo(_) | ProxyError::UpstreamProtocol(_) => {
                Some((502, "Bad Gateway"))
            }
            ProxyError::TunnelRefused { headers, .. } => {
                if headers
                    .iter()
                    .any(|(k, _)| k.eq_ignore_ascii_case("proxy-authenticate"))
                {
                    Some((407, "Proxy Authentication Required"))
                } else {
                    Some((502, "Bad Gateway"))
                }
            }
            ProxyError::AuthExhausted => Some((502, "Bad Gateway")),
            ProxyError::Configuration(_) | ProxyError::IllegalState(_) => None,
        }
    }

    /// `Proxy-Authenticate` header value to forward verbatim on a
    /// refused tunnel (supplemental behavior, SPEC_FULL.md §B).
    pub fn proxy_authenticate(&self) -> Option<&str> {
        match self {
            ProxyError::TunnelRefused { headers, .. } => headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("proxy-authenticate"))
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
