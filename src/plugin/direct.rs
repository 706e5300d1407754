//! Transparent relay and CONNECT tunneling.
//!
//! # Responsibilities
//! - Relay plain requests upstream through the network provider
//! - Log an access line for every completed relay
//! - Write the upstream response verbatim in the response stage
//! - Open CONNECT tunnels and splice bytes until one side closes
//!
//! # Design Decisions
//! - The upstream is dialed before the client connection is hijacked, so a
//!   failed dial still produces a 502
//! - Decrypted connections relay over https to the host they were intercepted for

use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header::CONTENT_LENGTH;
use http::{Request, Response};
use http_body_util::Full;
use tokio::io::AsyncWriteExt;

use crate::http::request::remove_hop_by_hop;
use crate::http::{ProxyBody, ProxyRequest, RequestError, ResponseWriter};
use crate::net::splice::splice;
use crate::observability::metrics;
use crate::plugin::{Plugin, PluginError, TUNNEL_ESTABLISHED};
use crate::proxy::PluginContext;

/// Relays requests and tunnels as-is.
#[derive(Debug, Clone, Default)]
pub struct Direct {
    tunnel_idle: Option<Duration>,
}

impl Direct {
    pub const NAME: &'static str = "direct";

    pub fn new(tunnel_idle: Option<Duration>) -> Self {
        Self { tunnel_idle }
    }

    async fn relay(&self, ctx: &PluginContext<'_>, req: &ProxyRequest) -> Result<Response<ProxyBody>, PluginError> {
        let uri = req.absolute_uri()?;
        let mut headers = req.headers.clone();
        remove_hop_by_hop(&mut headers);

        let mut upstream = Request::new(Full::new(req.body.clone()));
        *upstream.method_mut() = req.method.clone();
        *upstream.uri_mut() = uri;
        *upstream.headers_mut() = headers;

        let started = Instant::now();
        let response = ctx.network().round_trip(upstream).await?;
        metrics::record_relay(req.method.as_str(), response.status().as_u16(), started);
        tracing::info!("{}", access_line(req, &response));
        Ok(response)
    }

    async fn tunnel(
        &self,
        ctx: &PluginContext<'_>,
        rw: &mut ResponseWriter,
        req: &ProxyRequest,
    ) -> Result<(), PluginError> {
        let target = req
            .connect_authority()
            .ok_or_else(|| RequestError::NoTarget(req.uri.to_string()))?;
        let network = ctx.network();
        let upstream = network.dial(&target, network.timeout()).await?;

        let mut client = rw.hijack()?;
        client.stream.write_all(TUNNEL_ESTABLISHED).await?;
        client.stream.flush().await?;

        tracing::info!(
            remote = %req.conn.remote_addr,
            target = %target,
            "DIRECT tunnel opened"
        );
        metrics::record_tunnel(Self::NAME);

        splice(client.stream, upstream, self.tunnel_idle).await;
        tracing::debug!(target = %target, "DIRECT tunnel closed");
        Ok(())
    }
}

#[async_trait]
impl Plugin for Direct {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle_request(
        &self,
        ctx: &PluginContext<'_>,
        rw: &mut ResponseWriter,
        req: &ProxyRequest,
    ) -> Result<Option<Response<ProxyBody>>, PluginError> {
        if req.is_connect() {
            self.tunnel(ctx, rw, req).await?;
            return Ok(None);
        }
        self.relay(ctx, req).await.map(Some)
    }

    fn handles_responses(&self) -> bool {
        true
    }

    async fn handle_response(
        &self,
        _ctx: &PluginContext<'_>,
        rw: &mut ResponseWriter,
        _req: &ProxyRequest,
        response: Response<ProxyBody>,
    ) -> Result<(), PluginError> {
        rw.send(response).await?;
        Ok(())
    }
}

/// `<remote> "DIRECT <method> <target> <proto>" <status> <length>`, with `-`
/// when the upstream sent no Content-Length.
fn access_line(req: &ProxyRequest, response: &Response<ProxyBody>) -> String {
    let length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    format!(
        "{} \"DIRECT {} {} {}\" {} {}",
        req.conn.remote_addr,
        req.method,
        req.target(),
        req.proto(),
        response.status().as_u16(),
        length
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use rustls::ClientConfig;
    use tokio::io::{AsyncReadExt, DuplexStream};

    use crate::filter::{FilterChain, PluginArgs};
    use crate::http::conn::ClientConn;
    use crate::http::full_body;
    use crate::net::{Accepted, BoxedStream, ConnectionInfo};
    use crate::network::{Network, NetworkError};
    use crate::proxy::{Dispatcher, Handler, Reinjection};
    use crate::plugin::PluginRegistry;

    /// Records relayed requests and hands out scripted dial results.
    #[derive(Default)]
    struct FakeNetwork {
        seen: Mutex<Vec<(Method, String, Bytes)>>,
        upstream: Mutex<Option<DuplexStream>>,
    }

    #[async_trait]
    impl Network for FakeNetwork {
        async fn resolve(&self, _host: &str) -> Result<IpAddr, NetworkError> {
            Ok(IpAddr::from([127, 0, 0, 1]))
        }

        async fn dial(&self, addr: &str, _timeout: Duration) -> Result<BoxedStream, NetworkError> {
            match self.upstream.lock().unwrap().take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(NetworkError::Dial {
                    addr: addr.to_string(),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                }),
            }
        }

        async fn dial_tls(
            &self,
            addr: &str,
            _server_name: &str,
            _config: Arc<ClientConfig>,
            timeout: Duration,
        ) -> Result<BoxedStream, NetworkError> {
            self.dial(addr, timeout).await
        }

        async fn round_trip(&self, request: Request<Full<Bytes>>) -> Result<Response<ProxyBody>, NetworkError> {
            let (parts, body) = request.into_parts();
            let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
            assert!(!parts.headers.contains_key("proxy-connection"));
            self.seen.lock().unwrap().push((parts.method, parts.uri.to_string(), body));
            Ok(Response::builder()
                .status(StatusCode::ACCEPTED)
                .header(CONTENT_LENGTH, "3")
                .body(full_body("yes"))
                .unwrap())
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    fn handler(network: Arc<FakeNetwork>) -> Handler {
        let dispatcher = Dispatcher::new(FilterChain::new(), PluginRegistry::new()).unwrap();
        Handler::new(network, Reinjection::Loopback("127.0.0.1:1080".parse().unwrap()), dispatcher)
    }

    fn remote() -> SocketAddr {
        "10.0.0.9:4444".parse().unwrap()
    }

    #[tokio::test]
    async fn relays_plain_request_without_hop_headers() {
        let network = Arc::new(FakeNetwork::default());
        let handler = handler(network.clone());
        let ctx = PluginContext::new(&handler, PluginArgs::new());

        let mut req = ProxyRequest::new(Method::POST, "http://origin.test/form".parse().unwrap(), ConnectionInfo::plain(remote()));
        req.headers.insert("proxy-connection", "keep-alive".parse().unwrap());
        req.body = Bytes::from_static(b"a=1");

        let mut rw = ResponseWriter::recorder();
        let response = Direct::default().handle_request(&ctx, &mut rw, &req).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(rw.is_writable());

        let seen = network.seen.lock().unwrap();
        assert_eq!(seen[0].0, Method::POST);
        assert_eq!(seen[0].1, "http://origin.test/form");
        assert_eq!(&seen[0].2[..], b"a=1");
    }

    #[tokio::test]
    async fn decrypted_request_relays_over_https() {
        let network = Arc::new(FakeNetwork::default());
        let handler = handler(network.clone());
        let ctx = PluginContext::new(&handler, PluginArgs::new());

        let info = ConnectionInfo::decrypted(remote(), Some("bank.test".into()));
        let mut req = ProxyRequest::new(Method::GET, "/account".parse().unwrap(), info);
        req.headers.insert("host", "bank.test".parse().unwrap());

        let mut rw = ResponseWriter::recorder();
        Direct::default().handle_request(&ctx, &mut rw, &req).await.unwrap();
        assert_eq!(network.seen.lock().unwrap()[0].1, "https://bank.test/account");
    }

    #[tokio::test]
    async fn response_stage_writes_verbatim() {
        let network = Arc::new(FakeNetwork::default());
        let handler = handler(network);
        let ctx = PluginContext::new(&handler, PluginArgs::new());
        let req = ProxyRequest::new(Method::GET, "http://origin.test/".parse().unwrap(), ConnectionInfo::plain(remote()));

        let mut rw = ResponseWriter::recorder();
        let response = Response::builder().status(404).body(full_body("nope")).unwrap();
        Direct::default().handle_response(&ctx, &mut rw, &req, response).await.unwrap();

        let recorded = rw.recorded().unwrap();
        assert_eq!(recorded.status, StatusCode::NOT_FOUND);
        assert_eq!(&recorded.body[..], b"nope");
    }

    #[test]
    fn access_line_is_built_from_the_relayed_response() {
        let req = ProxyRequest::new(Method::GET, "http://origin.test/a?b=1".parse().unwrap(), ConnectionInfo::plain(remote()));

        let sized = Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(CONTENT_LENGTH, "3")
            .body(full_body("yes"))
            .unwrap();
        assert_eq!(
            access_line(&req, &sized),
            "10.0.0.9:4444 \"DIRECT GET http://origin.test/a?b=1 HTTP/1.1\" 202 3"
        );

        let no_body = Response::builder().status(204).body(full_body("")).unwrap();
        assert!(access_line(&req, &no_body).ends_with("\" 204 -"));
    }

    /// Log sink shared with a thread-local subscriber.
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn relay_logs_access_line_without_response_stage() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let handler = handler(Arc::new(FakeNetwork::default()));
        let ctx = PluginContext::new(&handler, PluginArgs::new());
        let req = ProxyRequest::new(Method::GET, "http://origin.test/quiet".parse().unwrap(), ConnectionInfo::plain(remote()));

        // Only the request stage runs, as when no response filter matches.
        let mut rw = ResponseWriter::recorder();
        Direct::default().handle_request(&ctx, &mut rw, &req).await.unwrap();

        let output = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        assert!(
            output.contains("10.0.0.9:4444 \"DIRECT GET http://origin.test/quiet HTTP/1.1\" 202 3"),
            "{output}"
        );
    }

    #[tokio::test]
    async fn connect_acknowledges_then_splices() {
        let (upstream_ours, mut upstream_theirs) = tokio::io::duplex(1024);
        let network = Arc::new(FakeNetwork {
            upstream: Mutex::new(Some(upstream_ours)),
            ..FakeNetwork::default()
        });
        let handler = handler(network);

        let (client_ours, mut client_theirs) = tokio::io::duplex(1024);
        let conn = ClientConn::new(Accepted::new(client_ours, ConnectionInfo::plain(remote())));
        let req = ProxyRequest::new(Method::CONNECT, "origin.test:443".parse().unwrap(), ConnectionInfo::plain(remote()));
        let mut rw = ResponseWriter::for_conn(conn, &Method::CONNECT, http::Version::HTTP_11, true);

        let task = tokio::spawn(async move {
            let ctx = PluginContext::new(&handler, PluginArgs::new());
            Direct::default().handle_request(&ctx, &mut rw, &req).await.map(|r| r.is_none())
        });

        let mut ack = [0u8; 19];
        client_theirs.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, TUNNEL_ESTABLISHED);

        use tokio::io::AsyncWriteExt;
        client_theirs.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client_theirs);
        assert!(task.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn failed_dial_leaves_writer_writable() {
        let handler = handler(Arc::new(FakeNetwork::default()));
        let ctx = PluginContext::new(&handler, PluginArgs::new());
        let req = ProxyRequest::new(Method::CONNECT, "down.test:443".parse().unwrap(), ConnectionInfo::plain(remote()));

        let mut rw = ResponseWriter::recorder();
        let err = Direct::default().handle_request(&ctx, &mut rw, &req).await.unwrap_err();
        assert!(matches!(err, PluginError::Network(NetworkError::Dial { .. })));
        assert!(rw.is_writable());
    }
}
