use std::sync::OnceLock;

use crate::config::UserConfig;
use crate::error::ProxyError;

/// Immutable once materialized. One instance per process lifetime, per
/// spec.md §3/§4.1. The password lives in this single owned `String`
/// for the process's life and is scrubbed on drop (spec.md §9: "a
/// rewrite should keep them in a single owned buffer zeroed on
/// shutdown where the platform allows").
#[derive(Debug, Clone)]
pub struct CredentialsProvider {
    pub user: String,
    pub password: String,
    pub workstation: Option<String>,
    pub domain: Option<String>,
}

impl Drop for CredentialsProvider {
    fn drop(&mut self) {
        zero_string(&mut self.password);
    }
}

fn zero_string(s: &mut String) {
    // SAFETY: we only overwrite existing bytes in place and never
    // change the vector's length or violate UTF-8 validity because
    // every written byte is ASCII `0`.
    unsafe {
        for b in s.as_bytes_mut() {
            *b = 0;
        }
    }
}

/// Lazily materializes a [`CredentialsProvider`] from [`UserConfig`],
/// with double-checked single initialization (spec.md §4.1). The
/// idiomatic Rust primitive for this is `std::sync::OnceLock`, which
/// already gives the single-visibility-barrier guarantee the spec asks
/// for under concurrent first calls.
pub struct CredentialsStore {
    cell: OnceLock<CredentialsProvider>,
}

impl CredentialsStore {
    pub fn new() -> Self {
        CredentialsStore {
            cell: OnceLock::new(),
        }
    }

    /// First call materializes the provider from `cfg`; every later
    /// call (concurrent or not) returns the same instance. Fails with
    /// `ConfigurationError` before any socket is opened if required
    /// fields are absent.
    pub fn get(&self, cfg: &UserConfig) -> Result<&CredentialsProvider, ProxyError> {
        if let Some(existing) = self.cell.get() {
            return Ok(existing);
        }
        let provider = materialize(cfg)?;
        // If another thread raced us and won, `set` fails silently and
        // we just read back whatever is there — both candidates were
        // built from the same immutable `cfg`, so they're equivalent.
        let _ = self.cell.set(provider);
        Ok(self.cell.get().expect("just initialized"))
    }
}

impl Default for CredentialsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn materialize(cfg: &UserConfig) -> Result<CredentialsProvider, ProxyError> {
    if cfg.username.trim().is_empty() {
        return Err(ProxyError::Configuration("username must not be empty".into()));
    }
    if cfg.password.is_empty() {
        return Err(ProxyError::Configuration("password must not be empty".into()));
    }
    Ok(CredentialsProvider {
        user: cfg.username.clone(),
        password: cfg.password.clone(),
        workstation: None,
        domain: cfg.domain.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(username: &str, password: &str) -> UserConfig {
        UserConfig {
            username: username.to_string(),
            password: password.to_string(),
            domain: Some("CORP".to_string()),
            proxy_host: "proxy.corp.example".to_string(),
            proxy_port: 8080,
            local_port: 3128,
        }
    }

    #[test]
    fn get_returns_same_instance_across_calls() {
        let store = CredentialsStore::new();
        let c = cfg("alice", "hunter2");
        let a = store.get(&c).unwrap() as *const _;
        let b = store.get(&c).unwrap() as *const _;
        assert_eq!(a, b);
    }

    #[test]
    fn empty_username_is_configuration_error() {
        let store = CredentialsStore::new();
        let c = cfg("", "hunter2");
        assert!(matches!(store.get(&c), Err(ProxyError::Configuration(_))));
    }

    #[test]
    fn empty_password_is_configuration_error() {
        let store = CredentialsStore::new();
        let c = cfg("alice", "");
        assert!(matches!(store.get(&c), Err(ProxyError::Configuration(_))));
    }
}
