//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Build the plugin registry and cross-check it against the filters
//! - Bind the listener and wire the re-injection mode
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The listener binds last (traffic only when ready)

use std::sync::Arc;

use thiserror::Error;

use crate::config::validation::validate_config;
use crate::config::{ConfigError, ProxyConfig, ReinjectMode};
use crate::http::HttpServer;
use crate::net::listener::ListenerError;
use crate::net::tls::TlsError;
use crate::net::PushListener;
use crate::network::{Network, SimpleNetwork};
use crate::plugin::PluginRegistry;
use crate::proxy::{Dispatcher, Handler, Reinjection, SetupError};

/// Errors that prevent the proxy from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("plugin setup error: {0}")]
    Setup(#[from] SetupError),

    #[error("TLS setup error: {0}")]
    Tls(#[from] TlsError),

    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("metrics setup error: {0}")]
    Metrics(String),
}

/// Start the proxy with the default network provider.
pub async fn start(config: &ProxyConfig) -> Result<HttpServer, StartupError> {
    let network = SimpleNetwork::new(&config.network)?;
    start_with_network(config, Arc::new(network)).await
}

/// Start the proxy over a caller-supplied network provider.
///
/// The returned server is bound but not yet accepting; call [`HttpServer::run`].
pub async fn start_with_network(config: &ProxyConfig, network: Arc<dyn Network>) -> Result<HttpServer, StartupError> {
    validate_config(config).map_err(ConfigError::Validation)?;

    let registry = PluginRegistry::standard(config);
    let dispatcher = Dispatcher::from_config(config, registry)?;
    tracing::info!(
        request_filters = config.request_filters.len(),
        response_filters = config.response_filters.len(),
        "Filter chain validated"
    );

    let listener = Arc::new(PushListener::bind(&config.listener).await?);
    let reinjection = match config.listener.reinject {
        ReinjectMode::Push => Reinjection::Push(listener.pusher()),
        ReinjectMode::Loopback => Reinjection::Loopback(listener.local_addr()),
    };
    tracing::info!(
        address = %listener.local_addr(),
        reinject = ?config.listener.reinject,
        cert_dir = %config.interception.cert_dir,
        "Proxy ready"
    );

    let handler = Arc::new(Handler::new(network, reinjection, dispatcher));
    Ok(HttpServer::new(handler, listener, config.limits.clone()))
}
