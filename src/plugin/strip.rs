//! TLS interception for CONNECT tunnels.
//!
//! # Responsibilities
//! - Acknowledge the tunnel and terminate the client's TLS with a per-host certificate
//! - Feed the decrypted stream back into the server, so plaintext requests run
//!   through the filter chain like any other connection
//!
//! # Data Flow
//! ```text
//! CONNECT host:443
//!     → hijack, write "200 OK"
//!     → CertStore lookup for host
//!     → TLS server handshake (network timeout)
//!     → Push: listener queue          Loopback: dial own address, splice
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use http::Response;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;

use crate::http::{ProxyBody, ProxyRequest, RequestError, ResponseWriter};
use crate::net::splice::splice;
use crate::net::tls::{CertStore, ClientAuth};
use crate::net::{Accepted, ConnectionInfo};
use crate::network::NetworkError;
use crate::observability::metrics;
use crate::plugin::{Plugin, PluginError, TUNNEL_ESTABLISHED};
use crate::proxy::{PluginContext, Reinjection};

/// Terminates client TLS and re-injects the plaintext connection.
#[derive(Debug, Clone)]
pub struct Strip {
    certs: CertStore,
    client_auth: ClientAuth,
}

impl Strip {
    pub const NAME: &'static str = "strip";

    pub fn new(certs: CertStore, client_auth: ClientAuth) -> Self {
        Self { certs, client_auth }
    }
}

#[async_trait]
impl Plugin for Strip {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle_request(
        &self,
        ctx: &PluginContext<'_>,
        rw: &mut ResponseWriter,
        req: &ProxyRequest,
    ) -> Result<Option<Response<ProxyBody>>, PluginError> {
        if !req.is_connect() {
            return Err(PluginError::NotConnect {
                plugin: Self::NAME.to_string(),
                method: req.method.clone(),
            });
        }
        let host = req.host().ok_or_else(|| RequestError::NoTarget(req.uri.to_string()))?;

        let mut client = rw.hijack()?;
        client.stream.write_all(TUNNEL_ESTABLISHED).await?;
        client.stream.flush().await?;
        tracing::info!(remote = %req.conn.remote_addr, host = %host, "STRIP intercepting tunnel");

        let config = self.certs.server_config(&host, self.client_auth)?;
        let acceptor = TlsAcceptor::from(config);
        let timeout = ctx.network().timeout();
        let tls = match tokio::time::timeout(timeout, acceptor.accept(client.stream)).await {
            Err(_) => {
                return Err(NetworkError::Timeout {
                    op: "client TLS handshake",
                    after: timeout,
                }
                .into())
            }
            Ok(Err(e)) => return Err(PluginError::Handshake(e.to_string())),
            Ok(Ok(tls)) => tls,
        };

        let server_name = tls
            .get_ref()
            .1
            .server_name()
            .map(str::to_string)
            .unwrap_or(host);
        metrics::record_tunnel(Self::NAME);

        match ctx.reinjection() {
            Reinjection::Push(pusher) => {
                tracing::debug!(server_name = %server_name, "Pushing decrypted connection");
                let info = ConnectionInfo::decrypted(client.info.remote_addr, Some(server_name));
                pusher.push(Ok(Accepted::new(tls, info))).await;
            }
            Reinjection::Loopback(listen) => {
                let target = loopback_target(*listen);
                tracing::debug!(server_name = %server_name, target = %target, "Looping decrypted connection back");
                let local = ctx.network().dial(&target.to_string(), timeout).await?;
                splice(tls, local, None).await;
            }
        }
        Ok(None)
    }
}

/// Address to dial to reach our own listener.
fn loopback_target(listen: SocketAddr) -> SocketAddr {
    match listen {
        SocketAddr::V4(a) if a.ip().is_unspecified() => SocketAddr::from((Ipv4Addr::LOCALHOST, a.port())),
        SocketAddr::V6(a) if a.ip().is_unspecified() => SocketAddr::from((Ipv6Addr::LOCALHOST, a.port())),
        other => other,
    }
}
