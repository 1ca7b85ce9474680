//! vmgate gateway server: entry point.
//!
//! Connects to every configured hypervisor and serves the cable WebSocket
//! through which browsers subscribe to domain events, change power states and
//! request screenshots.
//!
//! # Usage
//!
//! ```text
//! vmgate-server [OPTIONS]
//!
//! Options:
//!   --config     <PATH>  TOML configuration file [default: vmgate.toml]
//!   --bind       <ADDR>  Override `server.bind_address`
//!   --cable-port <PORT>  Override `server.cable_port`
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable            | Overrides            |
//! |---------------------|----------------------|
//! | `VMGATE_CONFIG`     | `--config`           |
//! | `VMGATE_BIND`       | `server.bind_address`|
//! | `VMGATE_CABLE_PORT` | `server.cable_port`  |
//! | `RUST_LOG`          | `server.log_level`   |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vmgate_server::application::catalog::HypervisorPool;
use vmgate_server::infrastructure::cable::{CableServer, CableServerConfig};
use vmgate_server::infrastructure::connector::UriConnector;
use vmgate_server::infrastructure::storage::config::{load_config, AppConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Virtual-machine lifecycle gateway.
#[derive(Debug, Parser)]
#[command(
    name = "vmgate-server",
    about = "Hypervisor gateway with a WebSocket push channel",
    version
)]
struct Cli {
    /// Path of the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "vmgate.toml", env = "VMGATE_CONFIG")]
    config: PathBuf,

    /// IP address the cable server binds to.
    #[arg(long, env = "VMGATE_BIND")]
    bind: Option<String>,

    /// TCP port of the cable server.
    #[arg(long, env = "VMGATE_CABLE_PORT")]
    cable_port: Option<u16>,
}

impl Cli {
    /// Loads the configuration file and applies command-line overrides.
    fn into_app_config(self) -> anyhow::Result<AppConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(port) = self.cable_port {
            config.server.cable_port = port;
        }
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_app_config()?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    let bind_addr: SocketAddr = config
        .cable_addr()
        .parse()
        .with_context(|| format!("invalid cable bind address: '{}'", config.cable_addr()))?;
    let endpoints = config.endpoints()?;

    info!(
        "vmgate starting: cable={bind_addr}, hypervisors={}",
        endpoints.len()
    );

    // Opening hypervisor connections blocks.
    let pool = tokio::task::spawn_blocking(move || {
        HypervisorPool::connect_all(&endpoints, &UriConnector)
    })
    .await
    .context("connecting to hypervisors")?;
    let pool = Arc::new(pool);

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    let server = CableServer::bind(
        CableServerConfig {
            bind_addr,
            screenshot_dir: config.screenshots.directory.clone(),
            screenshot_timeout: config.screenshots.timeout(),
        },
        Arc::clone(&pool),
    )
    .await?;
    server.run(running).await?;

    let closing = Arc::clone(&pool);
    tokio::task::spawn_blocking(move || closing.close_all())
        .await
        .context("closing hypervisor connections")?;

    info!("vmgate stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
