//! Forward HTTP proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌───────────────────────────────────────────────────────┐
//!                        │                    FORWARD PROXY                      │
//!                        │                                                       │
//!     Client Request     │  ┌──────────┐   ┌─────────┐   ┌────────────────────┐  │
//!     ───────────────────┼─▶│   push   │──▶│  http   │──▶│ request filters    │  │
//!                        │  │ listener │   │ server  │   │ (first match wins) │  │
//!                        │  └────▲─────┘   └─────────┘   └─────────┬──────────┘  │
//!                        │       │                                 ▼            │
//!                        │       │  decrypted          ┌────────────────────┐   │
//!                        │       └─────────────────────│ plugin: strip      │   │
//!                        │          connection         │ plugin: direct ────┼───┼──▶ Origin
//!                        │                             └─────────┬──────────┘   │
//!                        │                                       ▼              │
//!     Client Response    │                             ┌────────────────────┐   │
//!     ◀──────────────────┼─────────────────────────────│ response filters   │   │
//!                        │                             └────────────────────┘   │
//!                        └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use forward_proxy::config::{load_config, ProxyConfig};
use forward_proxy::lifecycle::shutdown::drain;
use forward_proxy::lifecycle::{self, signals, Shutdown};
use forward_proxy::observability::{logging, metrics};

/// Grace period for open connections after a stop signal.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "forward-proxy")]
#[command(about = "Forward HTTP proxy with pluggable relay and TLS interception", long_about = None)]
struct Args {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listener.bind_address = listen;
    }

    logging::init(&config.observability);
    tracing::info!("forward-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        timeout_secs = config.network.timeout_secs,
        request_filters = config.request_filters.len(),
        response_filters = config.response_filters.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: std::net::SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)
            .map_err(|e| lifecycle::StartupError::Metrics(e.to_string()))?;
        tracing::info!(address = %addr, "Metrics exporter listening");
    }

    let server = lifecycle::start(&config).await?;
    tracing::info!(address = %server.local_addr(), "Listening for connections");

    let shutdown = Arc::new(Shutdown::new());
    signals::spawn_signal_listener(shutdown.clone());

    let tracker = server.tracker();
    server.run(shutdown.subscribe()).await;

    drain(&tracker, DRAIN_GRACE).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
