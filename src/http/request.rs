//! Request parsing and target normalisation.
//!
//! # Responsibilities
//! - Parse HTTP/1.1 request heads off a client connection
//! - Read `Content-Length` and chunked bodies under a size cap
//! - Derive host, target and absolute URI for proxying
//!
//! # Design Decisions
//! - Header size limits enforced before any body is read
//! - The read timeout bounds the whole head but only the gaps between body
//!   reads, so slow steady uploads complete
//! - CONNECT never has a body; bytes after its head stay buffered for the tunnel
//! - Relative request targets are only accepted on decrypted connections,
//!   where the scheme and authority come from the TLS session and Host header

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::{Authority, Scheme, Uri};
use http::{Method, Version};
use thiserror::Error;

use crate::config::LimitsConfig;
use crate::http::conn::ClientConn;
use crate::net::ConnectionInfo;

const MAX_HEADERS: usize = 128;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Errors reading a request off a client connection.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Parse(String),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("connection closed mid-request")]
    UnexpectedEof,

    #[error("timed out waiting for a request")]
    HeadTimeout,

    #[error("request body stalled for {0:?}")]
    BodyTimeout(Duration),

    #[error("cannot determine target of {0}")]
    NoTarget(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully read client request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub conn: ConnectionInfo,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri, conn: ConnectionInfo) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            conn,
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Protocol token as written on the request line.
    pub fn proto(&self) -> &'static str {
        match self.version {
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_09 => "HTTP/0.9",
            _ => "HTTP/1.1",
        }
    }

    /// Hostname the request is aimed at, without port, lowercased.
    pub fn host(&self) -> Option<String> {
        let host = match self.uri.host() {
            Some(host) => host.to_string(),
            None => match self.header_authority() {
                Some(authority) => authority.host().to_string(),
                None => self.conn.tls.as_ref()?.server_name.clone()?,
            },
        };
        Some(host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase())
    }

    /// `host:port` for CONNECT, defaulting the port to 443.
    pub fn connect_authority(&self) -> Option<String> {
        let authority = self.uri.authority()?;
        Some(match authority.port_u16() {
            Some(_) => authority.as_str().to_string(),
            None => format!("{}:443", authority.host()),
        })
    }

    /// Request target as logged: the authority for CONNECT, the absolute URI otherwise.
    pub fn target(&self) -> String {
        if self.is_connect() {
            return self.connect_authority().unwrap_or_else(|| self.uri.to_string());
        }
        self.absolute_uri()
            .map(|u| u.to_string())
            .unwrap_or_else(|_| self.uri.to_string())
    }

    /// Absolute form of the request URI.
    ///
    /// Relative targets are completed with `https` for decrypted connections
    /// and `http` otherwise, taking the authority from the Host header or SNI.
    pub fn absolute_uri(&self) -> Result<Uri, RequestError> {
        if self.uri.scheme().is_some() && self.uri.authority().is_some() {
            return Ok(self.uri.clone());
        }

        let scheme = if self.conn.is_tls() { Scheme::HTTPS } else { Scheme::HTTP };
        let authority = match self.header_authority() {
            Some(authority) => authority,
            None => self
                .conn
                .tls
                .as_ref()
                .and_then(|tls| tls.server_name.as_deref())
                .and_then(|name| name.parse::<Authority>().ok())
                .ok_or_else(|| RequestError::NoTarget(self.uri.to_string()))?,
        };

        let mut parts = self.uri.clone().into_parts();
        parts.scheme = Some(scheme);
        parts.authority = Some(authority);
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
        }
        Uri::from_parts(parts).map_err(|e| RequestError::Parse(e.to_string()))
    }

    /// Whether the client asked to close the connection after this exchange.
    pub fn wants_close(&self) -> bool {
        let tokens = connection_tokens(&self.headers);
        match self.version {
            Version::HTTP_11 => tokens.iter().any(|t| t == "close"),
            _ => !tokens.iter().any(|t| t == "keep-alive"),
        }
    }

    fn header_authority(&self) -> Option<Authority> {
        self.headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Authority>().ok())
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    for name in connection_tokens(headers) {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(TRANSFER_ENCODING);
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Read the next request from `conn`.
///
/// Returns `Ok(None)` when the client closed the connection between requests.
/// `limits.header_read_timeout_secs` bounds the head (including keep-alive
/// idle time) and each individual body read.
pub async fn read_request(
    conn: &mut ClientConn,
    limits: &LimitsConfig,
) -> Result<Option<ProxyRequest>, RequestError> {
    let read_timeout = Duration::from_secs(limits.header_read_timeout_secs);
    let head = match tokio::time::timeout(read_timeout, read_head(conn, limits.max_header_bytes)).await {
        Err(_) => return Err(RequestError::HeadTimeout),
        Ok(head) => match head? {
            Some(head) => head,
            None => return Ok(None),
        },
    };

    let body = if head.method == Method::CONNECT {
        Bytes::new()
    } else {
        let reader = BodyReader {
            limit: limits.max_body_bytes,
            idle: read_timeout,
        };
        reader.read(conn, &head.headers).await?
    };

    Ok(Some(ProxyRequest {
        method: head.method,
        uri: head.uri,
        version: head.version,
        headers: head.headers,
        body,
        conn: conn.info().clone(),
    }))
}

async fn read_head(conn: &mut ClientConn, max_header_bytes: usize) -> Result<Option<Head>, RequestError> {
    loop {
        if let Some((head, len)) = parse_head(conn.buffered())? {
            conn.take(len);
            return Ok(Some(head));
        }
        if conn.buffered().len() >= max_header_bytes {
            return Err(RequestError::HeadTooLarge {
                limit: max_header_bytes,
            });
        }
        if conn.fill().await? == 0 {
            if conn.buffered().is_empty() {
                return Ok(None);
            }
            return Err(RequestError::UnexpectedEof);
        }
    }
}

struct Head {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

fn parse_head(buf: &[u8]) -> Result<Option<(Head, usize)>, RequestError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut slots);
    let len = match req.parse(buf).map_err(|e| RequestError::Parse(e.to_string()))? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| RequestError::Parse("invalid method".into()))?;
    let uri = req
        .path
        .ok_or_else(|| RequestError::Parse("missing request target".into()))?
        .parse::<Uri>()
        .map_err(|e| RequestError::Parse(e.to_string()))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|e| RequestError::Parse(e.to_string()))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|e| RequestError::Parse(e.to_string()))?;
        headers.append(name, value);
    }

    Ok(Some((
        Head {
            method,
            uri,
            version,
            headers,
        },
        len,
    )))
}

/// Reads a request body under a size cap and a per-read idle bound.
struct BodyReader {
    limit: usize,
    idle: Duration,
}

impl BodyReader {
    async fn read(&self, conn: &mut ClientConn, headers: &HeaderMap) -> Result<Bytes, RequestError> {
        let chunked = headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return self.read_chunked(conn).await;
        }

        let length = match headers.get(CONTENT_LENGTH) {
            None => return Ok(Bytes::new()),
            Some(v) => v
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| RequestError::Parse("invalid Content-Length".into()))?,
        };
        if length > self.limit {
            return Err(RequestError::BodyTooLarge { limit: self.limit });
        }
        conn.fill_to(length, self.idle).await.map_err(|e| self.read_error(e))?;
        Ok(conn.take(length))
    }

    async fn read_chunked(&self, conn: &mut ClientConn) -> Result<Bytes, RequestError> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line(conn).await?;
            let size_field = line.split(|b| *b == b';').next().unwrap_or_default();
            let size = std::str::from_utf8(size_field)
                .ok()
                .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
                .ok_or_else(|| RequestError::Parse("invalid chunk size".into()))?;

            if size == 0 {
                // Trailers are read and dropped.
                while !self.read_line(conn).await?.is_empty() {}
                return Ok(body.freeze());
            }
            if size > self.limit.saturating_sub(body.len()) {
                return Err(RequestError::BodyTooLarge { limit: self.limit });
            }
            let framed = size
                .checked_add(2)
                .ok_or(RequestError::BodyTooLarge { limit: self.limit })?;

            conn.fill_to(framed, self.idle).await.map_err(|e| self.read_error(e))?;
            body.extend_from_slice(&conn.take(size));
            if &conn.take(2)[..] != b"\r\n" {
                return Err(RequestError::Parse("missing chunk terminator".into()));
            }
        }
    }

    /// Next CRLF-terminated line, without the terminator.
    async fn read_line(&self, conn: &mut ClientConn) -> Result<Bytes, RequestError> {
        loop {
            if let Some(pos) = conn.buffered().windows(2).position(|w| w == b"\r\n") {
                let line = conn.take(pos);
                conn.take(2);
                return Ok(line);
            }
            if conn.buffered().len() > 4096 {
                return Err(RequestError::Parse("chunk header too long".into()));
            }
            if conn.fill_within(self.idle).await.map_err(|e| self.read_error(e))? == 0 {
                return Err(RequestError::UnexpectedEof);
            }
        }
    }

    fn read_error(&self, err: std::io::Error) -> RequestError {
        match err.kind() {
            std::io::ErrorKind::TimedOut => RequestError::BodyTimeout(self.idle),
            _ => eof(err),
        }
    }
}

fn eof(err: std::io::Error) -> RequestError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        RequestError::UnexpectedEof
    } else {
        RequestError::Io(err)
    }
}
