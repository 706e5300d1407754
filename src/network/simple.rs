//! Default network provider backed by tokio, tokio-rustls and hyper.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::uri::{PathAndQuery, Uri};
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::NetworkConfig;
use crate::http::ProxyBody;
use crate::net::tls::{upstream_client_config, TlsError};
use crate::net::BoxedStream;
use crate::network::{Network, NetworkError};
use crate::resilience::timeouts::deadline;

/// Plain OS networking with one upstream connection per round trip.
#[derive(Debug, Clone)]
pub struct SimpleNetwork {
    timeout: Duration,
    aliases: HashMap<String, String>,
    tls: Arc<ClientConfig>,
}

impl SimpleNetwork {
    pub fn new(config: &NetworkConfig) -> Result<Self, TlsError> {
        Ok(Self {
            timeout: Duration::from_secs(config.timeout_secs),
            aliases: config.aliases.clone(),
            tls: upstream_client_config()?,
        })
    }

    /// Override the client TLS config used for `https` round trips.
    pub fn with_tls_config(mut self, tls: Arc<ClientConfig>) -> Self {
        self.tls = tls;
        self
    }
}

#[async_trait]
impl Network for SimpleNetwork {
    async fn resolve(&self, host: &str) -> Result<IpAddr, NetworkError> {
        let resolve = async {
            let mut addrs = tokio::net::lookup_host((host, 0))
                .await
                .map_err(|e| NetworkError::Resolve {
                    host: host.to_string(),
                    reason: e.to_string(),
                })?;
            addrs.next().map(|a| a.ip()).ok_or_else(|| NetworkError::Resolve {
                host: host.to_string(),
                reason: "no addresses".to_string(),
            })
        };
        deadline("resolve", self.timeout, resolve).await
    }

    async fn dial(&self, addr: &str, timeout: Duration) -> Result<BoxedStream, NetworkError> {
        let addr = self.address_alias(addr).unwrap_or_else(|| addr.to_string());
        let stream = deadline("dial", timeout, async {
            TcpStream::connect(&addr).await.map_err(|source| NetworkError::Dial {
                addr: addr.clone(),
                source,
            })
        })
        .await?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(addr = %addr, "Dialed upstream");
        Ok(Box::new(stream))
    }

    async fn dial_tls(
        &self,
        addr: &str,
        server_name: &str,
        config: Arc<ClientConfig>,
        timeout: Duration,
    ) -> Result<BoxedStream, NetworkError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| NetworkError::InvalidTarget(format!("{server_name}: {e}")))?;
        let stream = self.dial(addr, timeout).await?;
        let connector = TlsConnector::from(config);
        let tls = deadline("TLS handshake", timeout, async {
            connector.connect(name, stream).await.map_err(|e| NetworkError::Tls {
                server_name: server_name.to_string(),
                reason: e.to_string(),
            })
        })
        .await?;
        Ok(Box::new(tls))
    }

    async fn round_trip(&self, request: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, NetworkError> {
        let (mut parts, body) = request.into_parts();
        let target = UpstreamTarget::from_uri(&parts.uri)?;

        let stream = if target.tls {
            self.dial_tls(&target.authority, &target.host, self.tls.clone(), self.timeout)
                .await?
        } else {
            self.dial(&target.authority, self.timeout).await?
        };

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "Upstream connection closed with error");
            }
        });

        // Origin servers expect origin-form targets.
        let origin_form = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::from(origin_form);
        if !parts.headers.contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&target.host_header) {
                parts.headers.insert(HOST, value);
            }
        }

        let response = deadline("round trip", self.timeout, async {
            sender
                .send_request(Request::from_parts(parts, body))
                .await
                .map_err(NetworkError::from)
        })
        .await?;

        Ok(response.map(|body| body.boxed()))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn address_alias(&self, addr: &str) -> Option<String> {
        self.aliases.get(addr).cloned()
    }
}

/// Where a round trip connects to, derived from an absolute URI.
#[derive(Debug, PartialEq, Eq)]
struct UpstreamTarget {
    tls: bool,
    host: String,
    /// `host:port` to dial.
    authority: String,
    host_header: String,
}

impl UpstreamTarget {
    fn from_uri(uri: &Uri) -> Result<Self, NetworkError> {
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(NetworkError::InvalidTarget(format!("unsupported URI {uri}"))),
        };
        let host = uri
            .host()
            .ok_or_else(|| NetworkError::InvalidTarget(format!("missing host in {uri}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let default_port = if tls { 443 } else { 80 };
        let port = uri.port_u16().unwrap_or(default_port);
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let host_header = match uri.authority() {
            Some(a) => a.as_str().to_string(),
            None => host.clone(),
        };

        Ok(Self {
            tls,
            host,
            authority,
            host_header,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> SimpleNetwork {
        let mut config = NetworkConfig::default();
        config.timeout_secs = 2;
        config
            .aliases
            .insert("example.test:80".to_string(), "127.0.0.1:9".to_string());
        SimpleNetwork::new(&config).unwrap()
    }

    #[test]
    fn target_defaults_ports_by_scheme() {
        let t = UpstreamTarget::from_uri(&"https://example.com/a".parse().unwrap()).unwrap();
        assert!(t.tls);
        assert_eq!(t.authority, "example.com:443");

        let t = UpstreamTarget::from_uri(&"http://example.com:8080/".parse().unwrap()).unwrap();
        assert!(!t.tls);
        assert_eq!(t.authority, "example.com:8080");
        assert_eq!(t.host_header, "example.com:8080");
    }

    #[test]
    fn relative_uri_is_rejected() {
        let err = UpstreamTarget::from_uri(&"/only/path".parse().unwrap()).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidTarget(_)));
    }

    #[test]
    fn aliases_are_reported() {
        let net = network();
        assert_eq!(net.address_alias("example.test:80").as_deref(), Some("127.0.0.1:9"));
        assert_eq!(net.address_alias("other:80"), None);
        assert_eq!(net.timeout(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn round_trip_reaches_upstream() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(head.starts_with("GET /hello?x=1 HTTP/1.1\r\n"), "{head}");
            socket
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let request = Request::get(format!("http://{addr}/hello?x=1"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = network().round_trip(request).await.unwrap();
        assert_eq!(response.status(), 201);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn dial_failure_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = network()
            .dial(&addr.to_string(), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NetworkError::Dial { .. } | NetworkError::Timeout { .. }));
    }
}
