//! Network provider contract.
//!
//! # Responsibilities
//! - Resolve hostnames, dial TCP and TLS connections under a timeout
//! - Perform one HTTP/1.1 request/response round trip
//! - Report the configured timeout and optional address aliases
//!
//! # Design Decisions
//! - Plugins never open sockets themselves; everything upstream goes through
//!   [`Network`], so dispatch and plugin logic can be tested with fakes
//! - Streams are returned boxed so fakes can hand out in-memory pipes

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use rustls::ClientConfig;
use thiserror::Error;

use crate::http::ProxyBody;
use crate::net::BoxedStream;

pub mod simple;

pub use simple::SimpleNetwork;

/// Errors talking to upstream hosts.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {server_name} failed: {reason}")]
    Tls { server_name: String, reason: String },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Upstream network operations used by the proxy core.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    /// Resolve `host` to one address.
    async fn resolve(&self, host: &str) -> Result<IpAddr, NetworkError>;

    /// Open a TCP connection to `addr` (`host:port`).
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<BoxedStream, NetworkError>;

    /// Open a TLS connection to `addr`, verifying `server_name`.
    async fn dial_tls(
        &self,
        addr: &str,
        server_name: &str,
        config: Arc<ClientConfig>,
        timeout: Duration,
    ) -> Result<BoxedStream, NetworkError>;

    /// Send `request` (absolute URI) and return the response head with a streaming body.
    async fn round_trip(&self, request: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, NetworkError>;

    /// Timeout applied to dials, handshakes and round trips.
    fn timeout(&self) -> Duration;

    /// Replacement address for `addr`, used to redirect hosts in tests or injection setups.
    fn address_alias(&self, _addr: &str) -> Option<String> {
        None
    }
}
