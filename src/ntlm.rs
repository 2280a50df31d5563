//! NTLM (NT LAN Manager) challenge-response authentication against the
//! upstream corporate proxy.
//!
//! The wire flow (RFC 4559-style, carried in `Proxy-Authenticate` /
//! `Proxy-Authorization` per spec.md §6):
//! 1. We send a bare request; the proxy answers 407 with
//!    `Proxy-Authenticate: NTLM` (no payload).
//! 2. We send a Type-1 (Negotiate) message; the proxy answers 407 with
//!    `Proxy-Authenticate: NTLM <base64 Type-2 challenge>`.
//! 3. We send a Type-3 (Authenticate) message computed from that
//!    challenge; success yields a 2xx with no further challenge.
//!
//! This implements NTLMv2, the modern variant. Message layout and the
//! NTLMv2 response derivation are adapted from a reqwest-header-
//! oriented NTLM client into the raw-bytes/state-machine shape this
//! crate needs (see DESIGN.md).

use base64::Engine;

use crate::error::ProxyError;
use crate::http::head::HeaderList;

const NTLM_NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NTLM_NEGOTIATE_OEM: u32 = 0x0000_0002;
const NTLM_REQUEST_TARGET: u32 = 0x0000_0004;
const NTLM_NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NTLM_NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NTLM_NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NTLM_NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NTLM_NEGOTIATE_128: u32 = 0x2000_0000;
const NTLM_NEGOTIATE_56: u32 = 0x8000_0000;

/// A parsed Type-2 (Challenge) message from the upstream proxy.
#[derive(Debug, Clone)]
pub struct Type2Message {
    pub server_challenge: [u8; 8],
    pub flags: u32,
    pub target_info: Option<Vec<u8>>,
}

/// Per-connection NTLM state machine (spec.md §3, §9): `UNCHALLENGED →
/// CHALLENGE_RECEIVED → HANDSHAKE → SUCCESS | FAILURE`. Kept as its
/// own small state machine rather than ad-hoc fields on the
/// negotiator, as spec.md §9 asks.
#[derive(Debug, Clone)]
pub enum AuthState {
    Unchallenged,
    ChallengeReceived(Challenge),
    Handshake,
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub enum Challenge {
    /// Bare `Proxy-Authenticate: NTLM` with no payload: the proxy
    /// wants us to negotiate.
    Negotiate,
    /// A real Type-2 challenge to respond to with Type-3.
    Type2(Type2Message),
}

/// Drives one CONNECT's worth of NTLM rounds against a single
/// upstream authority. One instance per `TunnelSession` / per relay
/// route's auth round.
pub struct NtlmNegotiator {
    auth: NtlmCredentials,
    state: AuthState,
}

impl NtlmNegotiator {
    pub fn new(auth: NtlmCredentials) -> Self {
        NtlmNegotiator {
            auth,
            state: AuthState::Unchallenged,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// spec.md §4.4 step (b): the `Proxy-Authorization` value to
    /// attach to the next outgoing request, or `None` to send a bare
    /// request (the first round, or after a terminal state).
    pub fn pending_authorization(&self) -> Result<Option<String>, ProxyError> {
        match &self.state {
            AuthState::ChallengeReceived(Challenge::Negotiate) => Ok(Some(self.auth.type1_header())),
            AuthState::ChallengeReceived(Challenge::Type2(challenge)) => {
                Ok(Some(self.auth.type3_header(challenge)?))
            }
            _ => Ok(None),
        }
    }

    /// Record that the header returned by `pending_authorization` was
    /// actually sent, advancing `CHALLENGE_RECEIVED → HANDSHAKE`.
    pub fn mark_sent(&mut self) {
        if matches!(self.state, AuthState::ChallengeReceived(_)) {
            self.state = AuthState::Handshake;
        }
    }

    /// spec.md §4.4 step (d): inspect a response's status and
    /// `Proxy-Authenticate` headers. Returns `true` if another round
    /// is possible (the caller should iterate), `false` if the loop is
    /// over (either `Success` or a terminal `Failure`).
    pub fn process_response(&mut self, status: u16, headers: &HeaderList) -> bool {
        if (200..300).contains(&status) {
            self.state = AuthState::Success;
            return false;
        }
        match extract_challenge(headers) {
            Some(Challenge::Negotiate) if !matches!(self.state, AuthState::Handshake) => {
                self.state = AuthState::ChallengeReceived(Challenge::Negotiate);
                true
            }
            Some(Challenge::Type2(t2)) => {
                self.state = AuthState::ChallengeReceived(Challenge::Type2(t2));
                true
            }
            _ => {
                self.state = AuthState::Failure;
                false
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.state, AuthState::Success)
    }
}

/// Credentials + message codec. Immutable, cheaply cloned per
/// negotiation (built once from the process-wide `CredentialsProvider`).
#[derive(Debug, Clone)]
pub struct NtlmCredentials {
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
    pub workstation: Option<String>,
}

impl NtlmCredentials {
    pub fn type1_header(&self) -> String {
        let msg = self.generate_type1_message();
        format!("NTLM {}", base64::engine::general_purpose::STANDARD.encode(msg))
    }

    pub fn type3_header(&self, challenge: &Type2Message) -> Result<String, ProxyError> {
        let msg = self.generate_type3_message(challenge)?;
        Ok(format!("NTLM {}", base64::engine::general_purpose::STANDARD.encode(msg)))
    }

    fn generate_type1_message(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(40);
        msg.extend_from_slice(b"NTLMSSP\0");
        msg.extend_from_slice(&1u32.to_le_bytes());
        let flags = NTLM_NEGOTIATE_UNICODE
            | NTLM_NEGOTIATE_OEM
            | NTLM_REQUEST_TARGET
            | NTLM_NEGOTIATE_NTLM
            | NTLM_NEGOTIATE_ALWAYS_SIGN
            | NTLM_NEGOTIATE_EXTENDED_SESSIONSECURITY
            | NTLM_NEGOTIATE_TARGET_INFO
            | NTLM_NEGOTIATE_128
            | NTLM_NEGOTIATE_56;
        msg.extend_from_slice(&flags.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&0u32.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&0u32.to_le_bytes());
        msg
    }

    fn generate_type3_message(&self, type2: &Type2Message) -> Result<Vec<u8>, ProxyError> {
        use rand::RngCore;

        let domain = self.domain.as_deref().unwrap_or("");
        let workstation = self.workstation.as_deref().unwrap_or("");

        let mut client_challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut client_challenge);

        let (nt_response, lm_response) =
            self.compute_ntlmv2_response(&type2.server_challenge, &client_challenge, type2.target_info.as_deref())?;

        let domain_bytes = to_utf16le(domain);
        let username_bytes = to_utf16le(&self.username);
        let workstation_bytes = to_utf16le(workstation);

        let base_offset: u32 = 64;
        let lm_offset = base_offset;
        let nt_offset = lm_offset + lm_response.len() as u32;
        let domain_offset = nt_offset + nt_response.len() as u32;
        let username_offset = domain_offset + domain_bytes.len() as u32;
        let workstation_offset = username_offset + username_bytes.len() as u32;

        let mut msg = Vec::with_capacity(256);
        msg.extend_from_slice(b"NTLMSSP\0");
        msg.extend_from_slice(&3u32.to_le_bytes());

        msg.extend_from_slice(&(lm_response.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(lm_response.len() as u16).to_le_bytes());
        msg.extend_from_slice(&lm_offset.to_le_bytes());

        msg.extend_from_slice(&(nt_response.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(nt_response.len() as u16).to_le_bytes());
        msg.extend_from_slice(&nt_offset.to_le_bytes());

        msg.extend_from_slice(&(domain_bytes.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(domain_bytes.len() as u16).to_le_bytes());
        msg.extend_from_slice(&domain_offset.to_le_bytes());

        msg.extend_from_slice(&(username_bytes.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(username_bytes.len() as u16).to_le_bytes());
        msg.extend_from_slice(&username_offset.to_le_bytes());

        msg.extend_from_slice(&(workstation_bytes.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(workstation_bytes.len() as u16).to_le_bytes());
        msg.extend_from_slice(&workstation_offset.to_le_bytes());

        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&(workstation_offset + workstation_bytes.len() as u32).to_le_bytes());

        msg.extend_from_slice(&type2.flags.to_le_bytes());

        msg.extend_from_slice(&lm_response);
        msg.extend_from_slice(&nt_response);
        msg.extend_from_slice(&domain_bytes);
        msg.extend_from_slice(&username_bytes);
        msg.extend_from_slice(&workstation_bytes);

        Ok(msg)
    }

    fn compute_ntlmv2_response(
        &self,
        server_challenge: &[u8; 8],
        client_challenge: &[u8; 8],
        target_info: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Vec<u8>), ProxyError> {
        use hmac::{Hmac, Mac};
        use md4::{Digest as Md4Digest, Md4};
        use md5_digest::Md5;

        let password_utf16 = to_utf16le(&self.password);
        let mut md4 = Md4::new();
        md4.update(&password_utf16);
        let nt_hash = md4.finalize();

        let domain = self.domain.as_deref().unwrap_or("");
        let user_domain = format!("{}{}", self.username.to_uppercase(), domain);
        let user_domain_utf16 = to_utf16le(&user_domain);

        type HmacMd5 = Hmac<Md5>;
        let mut hmac = HmacMd5::new_from_slice(&nt_hash)
            .map_err(|e| ProxyError::UpstreamProtocol(format!("NTLM HMAC init failed: {e}")))?;
        hmac.update(&user_domain_utf16);
        let ntlmv2_hash = hmac.finalize().into_bytes();

        let timestamp = filetime_now();
        let mut blob = Vec::with_capacity(64 + target_info.map(|t| t.len()).unwrap_or(0));
        blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        blob.extend_from_slice(&timestamp);
        blob.extend_from_slice(client_challenge);
        blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        if let Some(info) = target_info {
            blob.extend_from_slice(info);
        }
        blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        let mut hmac = HmacMd5::new_from_slice(&ntlmv2_hash)
            .map_err(|e| ProxyError::UpstreamProtocol(format!("NTLM HMAC init failed: {e}")))?;
        hmac.update(server_challenge);
        hmac.update(&blob);
        let nt_proof = hmac.finalize().into_bytes();

        let mut nt_response = Vec::with_capacity(16 + blob.len());
        nt_response.extend_from_slice(&nt_proof);
        nt_response.extend_from_slice(&blob);

        let mut hmac = HmacMd5::new_from_slice(&ntlmv2_hash)
            .map_err(|e| ProxyError::UpstreamProtocol(format!("NTLM HMAC init failed: {e}")))?;
        hmac.update(server_challenge);
        hmac.update(client_challenge);
        let lm_proof = hmac.finalize().into_bytes();

        let mut lm_response = Vec::with_capacity(24);
        lm_response.extend_from_slice(&lm_proof);
        lm_response.extend_from_slice(client_challenge);

        Ok((nt_response, lm_response))
    }
}

fn to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// Windows FILETIME: 100ns intervals since 1601-01-01.
fn filetime_now() -> [u8; 8] {
    use std::time::{SystemTime, UNIX_EPOCH};
    const EPOCH_DIFF: u64 = 116_444_736_000_000_000;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let filetime = now.as_secs() * 10_000_000 + now.subsec_nanos() as u64 / 100 + EPOCH_DIFF;
    filetime.to_le_bytes()
}

/// Parses a Type-2 (Challenge) message.
pub fn parse_type2_message(data: &[u8]) -> Result<Type2Message, ProxyError> {
    if data.len() < 32 || &data[0..8] != b"NTLMSSP\0" {
        return Err(ProxyError::UpstreamProtocol("invalid NTLM Type-2 signature".into()));
    }
    let msg_type = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if msg_type != 2 {
        return Err(ProxyError::UpstreamProtocol(format!("expected NTLM Type-2, got Type-{msg_type}")));
    }
    let flags = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&data[24..32]);

    let target_info = if data.len() >= 48 && (flags & NTLM_NEGOTIATE_TARGET_INFO) != 0 {
        let len = u16::from_le_bytes([data[40], data[41]]) as usize;
        let offset = u32::from_le_bytes([data[44], data[45], data[46], data[47]]) as usize;
        if len > 0 && offset.saturating_add(len) <= data.len() {
            Some(data[offset..offset + len].to_vec())
        } else {
            None
        }
    } else {
        None
    };

    Ok(Type2Message {
        server_challenge,
        flags,
        target_info,
    })
}

/// Looks at all `Proxy-Authenticate` header values and classifies the
/// NTLM challenge (if any) they carry.
fn extract_challenge(headers: &HeaderList) -> Option<Challenge> {
    for (name, value) in headers {
        if !name.eq_ignore_ascii_case("proxy-authenticate") {
            continue;
        }
        let value = value.trim();
        let Some(rest) = value.strip_prefix("NTLM") else {
            continue;
        };
        let rest = rest.trim();
        if rest.is_empty() {
            return Some(Challenge::Negotiate);
        }
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(rest) {
            if let Ok(type2) = parse_type2_message(&decoded) {
                return Some(Challenge::Type2(type2));
            }
        }
    }
    None
}
