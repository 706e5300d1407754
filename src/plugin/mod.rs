//! Plugin subsystem.
//!
//! # Data Flow
//! ```text
//! Selection { plugin, args }
//!     → registry.rs (name → plugin)
//!     → handle_request (relay, tunnel or intercept)
//!     → optional response stage selected by response filters
//! ```
//!
//! # Design Decisions
//! - Plugins reach the network and the listener only through [`PluginContext`]
//! - A plugin that takes over the connection returns `Ok(None)`
//! - Errors before anything is written become a 502; later ones are only logged

use async_trait::async_trait;
use http::{Method, Response};
use thiserror::Error;

use crate::http::{HijackError, ProxyBody, ProxyRequest, RequestError, ResponseWriter, WriteError};
use crate::net::tls::TlsError;
use crate::network::NetworkError;
use crate::proxy::PluginContext;

pub mod direct;
pub mod registry;
pub mod strip;

pub use direct::Direct;
pub use registry::PluginRegistry;
pub use strip::Strip;

/// Written to the client once a CONNECT tunnel is up.
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Errors raised while handling a request.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("TLS handshake with client failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Hijack(#[from] HijackError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{plugin} requires CONNECT, got {method}")]
    NotConnect { plugin: String, method: Method },

    #[error("no plugin named '{0}'")]
    Unknown(String),

    #[error("plugin {0} has no response stage")]
    NoResponseStage(String),
}

/// A request handling strategy selected by the filter chain.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Handle `req`.
    ///
    /// Returning a response hands it to the response stage; returning `None`
    /// means the plugin wrote the response or took over the connection.
    async fn handle_request(
        &self,
        ctx: &PluginContext<'_>,
        rw: &mut ResponseWriter,
        req: &ProxyRequest,
    ) -> Result<Option<Response<ProxyBody>>, PluginError>;

    /// Whether response filters may select this plugin.
    fn handles_responses(&self) -> bool {
        false
    }

    /// Post-process and write a response produced by a request plugin.
    async fn handle_response(
        &self,
        _ctx: &PluginContext<'_>,
        _rw: &mut ResponseWriter,
        _req: &ProxyRequest,
        _response: Response<ProxyBody>,
    ) -> Result<(), PluginError> {
        Err(PluginError::NoResponseStage(self.name().to_string()))
    }
}
