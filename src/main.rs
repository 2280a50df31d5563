//! Binary entry-point for the local NTLM-authenticating forward proxy.

mod bridge;
mod config;
mod credentials;
mod error;
mod hop;
mod http;
mod ntlm;
mod pool;
mod relay;
mod server;
mod tunnel;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load CLI flags + YAML config ────────────────────────────────────────
    let (cli, user, system) = config::load_config()?;

    // ── 2. Init structured logging (env -> overrides flag) ─────────────────────
    // e.g. RUST_LOG=debug cargo run
    let log_level = cli
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("Configuration loaded from {:?}", cli.config);
    info!("Upstream proxy: {}:{}", user.proxy_host, user.proxy_port);
    info!("Authenticating as: {}", user.username);

    // ── 3. Build and run the proxy. Credentials and the connection pool
    // are constructed inside `Server::start` before the listener is bound,
    // so a configuration failure never leaves a bound port behind (see
    // DESIGN.md OQ-1). ──────────────────────────────────────────────────
    let server = Server::new(user, system);
    if let Err(e) = server.run().await {
        error!("proxy exited with error: {e:?}");
    }

    Ok(())
}
