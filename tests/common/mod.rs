//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use forward_proxy::config::ProxyConfig;
use forward_proxy::lifecycle::{self, Shutdown};
use forward_proxy::net::tls::{build_server_config, crypto_provider, ClientAuth};
use forward_proxy::network::Network;

/// Self-signed certificate written into a temporary certificate directory.
pub struct TestCert {
    pub dir: tempfile::TempDir,
    pub der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl TestCert {
    /// Issue a certificate for `hosts` and store it as `<hosts[0]>.crt`.
    pub fn issue(hosts: &[&str]) -> Self {
        let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        let certified = rcgen::generate_simple_self_signed(names).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pem = format!("{}{}", certified.cert.pem(), certified.key_pair.serialize_pem());
        std::fs::write(dir.path().join(format!("{}.crt", hosts[0])), pem).unwrap();

        Self {
            dir,
            der: certified.cert.der().clone(),
            key_der: certified.key_pair.serialize_der(),
        }
    }

    pub fn dir_path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let config = build_server_config(vec![self.der.clone()], key, ClientAuth::None).unwrap();
        TlsAcceptor::from(config)
    }

    /// Client config trusting only this certificate.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(self.der.clone()).unwrap();
        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Arc::new(config)
    }
}

/// Config listening on an ephemeral loopback port.
pub fn local_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.network.timeout_secs = 5;
    config
}

/// Start the proxy and return its address plus the shutdown handle.
pub async fn spawn_proxy(config: ProxyConfig, network: Option<Arc<dyn Network>>) -> (SocketAddr, Shutdown) {
    let server = match network {
        Some(network) => lifecycle::start_with_network(&config, network).await.unwrap(),
        None => lifecycle::start(&config).await.unwrap(),
    };
    let addr = server.local_addr();
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move { server.run(rx).await });
    (addr, shutdown)
}

/// Start a plain HTTP upstream that echoes what it received.
pub async fn start_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(echo_once(socket));
        }
    });
    addr
}

/// Start an HTTPS upstream that echoes what it received.
pub async fn start_tls_echo_upstream(acceptor: TlsAcceptor) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(socket).await {
                    echo_once(tls).await;
                }
            });
        }
    });
    addr
}

/// Answer one request with `<METHOD> <target> host=<host> body=<body>`.
async fn echo_once<S: AsyncRead + AsyncWrite + Unpin>(mut socket: S) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let (head_len, method, target, host, content_length) = loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        if let Ok(httparse::Status::Complete(len)) = req.parse(&buf) {
            let header = |name: &str| {
                req.headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case(name))
                    .map(|h| String::from_utf8_lossy(h.value).to_string())
            };
            let content_length = header("content-length").and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);
            break (
                len,
                req.method.unwrap_or_default().to_string(),
                req.path.unwrap_or_default().to_string(),
                header("host").unwrap_or_default(),
                content_length,
            );
        }
    };

    while buf.len() < head_len + content_length {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let body = String::from_utf8_lossy(&buf[head_len..head_len + content_length]);

    let reply = format!("{method} {target} host={host} body={body}");
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Upstream: echo\r\nConnection: close\r\n\r\n{}",
        reply.len(),
        reply
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Read until `needle` shows up or the peer closes.
pub async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, needle: &str) -> String {
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    let read = async {
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
            }
            if String::from_utf8_lossy(&out).contains(needle) {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(5), read).await;
    String::from_utf8_lossy(&out).to_string()
}
