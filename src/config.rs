use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ntlm-proxy", version, about = "Local NTLM-authenticating forward proxy")]
pub struct Cli {
    #[arg(long, default_value = "proxy.yaml")]
    pub config: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// User-facing settings: who we authenticate as, and where to listen/forward.
#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub local_port: u16,
}

/// Knobs that tune the resource model but carry no identity information.
#[derive(Debug, Deserialize, Clone)]
pub struct SystemConfig {
    #[serde(default = "default_socket_buffer_size")]
    pub socket_buffer_size: usize,
    #[serde(default = "default_socket_buffer_size")]
    pub server_socket_buffer_size: usize,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub max_connections_per_route: Option<usize>,
    #[serde(default = "default_true")]
    pub eviction_enabled: bool,
    #[serde(default = "default_eviction_period")]
    pub eviction_period_secs: u64,
    #[serde(default = "default_max_idle")]
    pub max_connection_idle_secs: u64,
    #[serde(default)]
    pub retries: bool,
}

fn default_socket_buffer_size() -> usize {
    64 * 1024
}
fn default_true() -> bool {
    true
}
fn default_eviction_period() -> u64 {
    30
}
fn default_max_idle() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub user: UserConfig,
    #[serde(default)]
    pub system: SystemConfigFile,
}

/// The YAML file may omit `system` entirely; all fields then fall back
/// to the same defaults `SystemConfig`'s own fields use.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SystemConfigFile {
    pub socket_buffer_size: Option<usize>,
    pub server_socket_buffer_size: Option<usize>,
    pub max_connections: Option<usize>,
    pub max_connections_per_route: Option<usize>,
    pub eviction_enabled: Option<bool>,
    pub eviction_period_secs: Option<u64>,
    pub max_connection_idle_secs: Option<u64>,
    pub retries: Option<bool>,
}

impl From<SystemConfigFile> for SystemConfig {
    fn from(f: SystemConfigFile) -> Self {
        SystemConfig {
            socket_buffer_size: f.socket_buffer_size.unwrap_or_else(default_socket_buffer_size),
            server_socket_buffer_size: f
                .server_socket_buffer_size
                .unwrap_or_else(default_socket_buffer_size),
            max_connections: f.max_connections,
            max_connections_per_route: f.max_connections_per_route,
            eviction_enabled: f.eviction_enabled.unwrap_or_else(default_true),
            eviction_period_secs: f.eviction_period_secs.unwrap_or_else(default_eviction_period),
            max_connection_idle_secs: f.max_connection_idle_secs.unwrap_or_else(default_max_idle),
            retries: f.retries.unwrap_or(false),
        }
    }
}

pub fn load_config() -> Result<(Cli, UserConfig, SystemConfig)> {
    let cli = Cli::parse();

    let yaml = fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read {}", cli.config.display()))?;

    let cfg: Config = serde_yaml::from_str(&yaml).context("Failed to parse YAML config")?;
    let system: SystemConfig = cfg.system.into();
    Ok((cli, cfg.user, system))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_config_defaults_when_omitted() {
        let yaml = r#"
user:
  username: alice
  password: secret
  proxy_host: proxy.corp.example
  proxy_port: 8080
  local_port: 3128
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let system: SystemConfig = cfg.system.into();
        assert_eq!(system.max_connection_idle_secs, 60);
        assert!(system.eviction_enabled);
        assert!(!system.retries);
    }

    #[test]
    fn user_config_parses_domain() {
        let yaml = r#"
user:
  username: alice
  password: secret
  domain: CORP
  proxy_host: proxy.corp.example
  proxy_port: 8080
  local_port: 3128
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.user.domain.as_deref(), Some("CORP"));
    }
}
