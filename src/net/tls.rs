//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Locate per-host PEM material in the certificate directory
//! - Build the server-side config used to terminate intercepted tunnels
//! - Build the client-side config used for upstream HTTPS

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading certificate material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no certificate for {host} in {dir}")]
    NotFound { host: String, dir: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key in {0}")]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Client certificate policy for intercepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    /// Request a client certificate and verify it if one is sent.
    #[default]
    Optional,
    /// Never ask for a client certificate.
    None,
}

/// Directory of per-host certificates produced offline.
#[derive(Debug, Clone)]
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files tried for `host`, most specific first.
    ///
    /// `www.example.com` → `www.example.com.crt`, `.example.com.crt`, `.com.crt`.
    pub fn candidates(&self, host: &str) -> Vec<PathBuf> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let mut paths = vec![self.dir.join(format!("{host}.crt"))];
        let mut rest = host.as_str();
        while let Some(idx) = rest.find('.') {
            rest = &rest[idx + 1..];
            if rest.is_empty() {
                break;
            }
            paths.push(self.dir.join(format!(".{rest}.crt")));
        }
        paths
    }

    /// Load the certificate chain and key for `host`.
    pub fn load(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
        let cert_path = self
            .candidates(host)
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| TlsError::NotFound {
                host: host.to_string(),
                dir: self.dir.clone(),
            })?;

        let key_path = cert_path.with_extension("key");
        let key_path = if key_path.is_file() { key_path } else { cert_path.clone() };

        tracing::debug!(host, cert = ?cert_path, key = ?key_path, "Loading interception certificate");
        load_pem_pair(&cert_path, &key_path)
    }

    /// Server config presenting `host`'s certificate.
    pub fn server_config(&self, host: &str, client_auth: ClientAuth) -> Result<Arc<ServerConfig>, TlsError> {
        let (certs, key) = self.load(host)?;
        build_server_config(certs, key, client_auth)
    }
}

/// Read a certificate chain and a private key from PEM files.
///
/// Both may live in the same file.
pub fn load_pem_pair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|source| TlsError::Read {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    Ok((certs, key))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Build a TLS server config for terminating client connections.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_auth: ClientAuth,
) -> Result<Arc<ServerConfig>, TlsError> {
    let builder = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?;
    let builder = match client_auth {
        ClientAuth::None => builder.with_no_client_auth(),
        ClientAuth::Optional => {
            let roots = Arc::new(webpki_root_store());
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, crypto_provider())
                .allow_unauthenticated()
                .build()
                .map_err(|e| TlsError::Config(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;
    // Decrypted traffic is re-parsed by the HTTP/1.1 front end.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Client config for upstream HTTPS, trusting the webpki root set.
pub fn upstream_client_config() -> Result<Arc<ClientConfig>, TlsError> {
    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_root_certificates(webpki_root_store())
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// The crypto provider shared by every TLS config the proxy builds.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn webpki_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}
