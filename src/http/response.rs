//! Response writing and connection hijacking.
//!
//! # Responsibilities
//! - Serialise a response head and stream its body to the client
//! - Hand the raw connection to plugins that take it over (tunnels, interception)
//! - Track whether anything has been written, so errors can still become a 502
//!
//! # Design Decisions
//! - Hop-by-hop headers stripped automatically
//! - Bodies keep upstream `Content-Length` framing; otherwise chunked, or
//!   close-delimited for HTTP/1.0 clients
//! - Hijack support is a property of the sink, fixed at construction

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{Method, Response, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use thiserror::Error;

use crate::http::conn::ClientConn;
use crate::http::request::remove_hop_by_hop;
use crate::net::connection::Rewind;
use crate::net::{BoxedStream, ConnectionInfo};

/// Body type flowing between upstream and client.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// `502 Bad Gateway` carrying the error text.
pub fn bad_gateway(err: &dyn std::fmt::Display) -> Response<ProxyBody> {
    plain_response(StatusCode::BAD_GATEWAY, format!("Error: {err}\n"))
}

pub fn plain_response(status: StatusCode, text: String) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Errors writing a response.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("response already written or connection hijacked")]
    NotWritable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream body error: {0}")]
    Body(#[from] hyper::Error),
}

/// Reasons a connection cannot be hijacked.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HijackError {
    #[error("this response writer cannot be hijacked")]
    Unsupported,

    #[error("response already started")]
    AlreadyCommitted,

    #[error("connection already hijacked")]
    AlreadyHijacked,
}

/// A connection taken over from the HTTP layer.
pub struct Hijacked {
    /// Raw stream; replays bytes the request parser had read ahead.
    pub stream: BoxedStream,
    pub info: ConnectionInfo,
}

/// A response captured by a recording writer.
#[derive(Debug, Clone)]
pub struct RecordedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Committed,
    Finished,
    Hijacked,
}

enum Sink {
    Conn(Option<ClientConn>),
    Recorder(Option<RecordedResponse>),
}

enum Framing {
    None,
    Length(u64),
    Chunked,
    Close,
}

/// Writes one response for one request.
pub struct ResponseWriter {
    sink: Sink,
    state: State,
    head_only: bool,
    version: Version,
    keep_alive: bool,
}

impl ResponseWriter {
    /// Writer over a live client connection; supports hijacking.
    pub fn for_conn(conn: ClientConn, method: &Method, version: Version, keep_alive: bool) -> Self {
        Self {
            sink: Sink::Conn(Some(conn)),
            state: State::Fresh,
            head_only: method == Method::HEAD,
            version,
            keep_alive,
        }
    }

    /// In-memory writer; `hijack` always fails with [`HijackError::Unsupported`].
    pub fn recorder() -> Self {
        Self {
            sink: Sink::Recorder(None),
            state: State::Fresh,
            head_only: false,
            version: Version::HTTP_11,
            keep_alive: false,
        }
    }

    /// True until a response is started or the connection is hijacked.
    pub fn is_writable(&self) -> bool {
        self.state == State::Fresh
    }

    pub fn is_hijacked(&self) -> bool {
        self.state == State::Hijacked
    }

    /// Response captured by a recorder.
    pub fn recorded(&self) -> Option<&RecordedResponse> {
        match &self.sink {
            Sink::Recorder(recorded) => recorded.as_ref(),
            Sink::Conn(_) => None,
        }
    }

    /// Take over the raw client connection.
    pub fn hijack(&mut self) -> Result<Hijacked, HijackError> {
        match self.state {
            State::Hijacked => return Err(HijackError::AlreadyHijacked),
            State::Committed | State::Finished => return Err(HijackError::AlreadyCommitted),
            State::Fresh => {}
        }
        let conn = match &mut self.sink {
            Sink::Recorder(_) => return Err(HijackError::Unsupported),
            Sink::Conn(conn) => conn.take().ok_or(HijackError::AlreadyHijacked)?,
        };
        self.state = State::Hijacked;

        let (stream, read_ahead, info) = conn.into_parts();
        Ok(Hijacked {
            stream: Box::new(Rewind::new(read_ahead, stream)),
            info,
        })
    }

    /// Write `response` and stream its body.
    pub async fn send(&mut self, response: Response<ProxyBody>) -> Result<(), WriteError> {
        if self.state != State::Fresh {
            return Err(WriteError::NotWritable);
        }
        let (parts, mut body) = response.into_parts();

        if let Sink::Recorder(slot) = &mut self.sink {
            self.state = State::Committed;
            let body = body.collect().await?.to_bytes();
            *slot = Some(RecordedResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            });
            self.state = State::Finished;
            return Ok(());
        }

        let mut headers = parts.headers;
        remove_hop_by_hop(&mut headers);

        let status = parts.status;
        let bodyless = self.head_only
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let framing = match declared {
            _ if bodyless => Framing::None,
            Some(len) => Framing::Length(len),
            None if self.version == Version::HTTP_11 => {
                headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                Framing::Chunked
            }
            None => {
                self.keep_alive = false;
                Framing::Close
            }
        };
        if !self.keep_alive {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        for (name, value) in headers.iter() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        let Sink::Conn(Some(conn)) = &mut self.sink else {
            return Err(WriteError::NotWritable);
        };
        self.state = State::Committed;
        conn.write_all(&head).await?;

        let mut written: u64 = 0;
        if !matches!(framing, Framing::None) {
            while let Some(frame) = body.frame().await {
                let Ok(data) = frame?.into_data() else {
                    continue;
                };
                if data.is_empty() {
                    continue;
                }
                written += data.len() as u64;
                if let Framing::Chunked = framing {
                    conn.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
                    conn.write_all(&data).await?;
                    conn.write_all(b"\r\n").await?;
                } else {
                    conn.write_all(&data).await?;
                }
            }
        }

        match framing {
            Framing::Chunked => conn.write_all(b"0\r\n\r\n").await?,
            Framing::Length(len) if len != written => self.keep_alive = false,
            _ => {}
        }
        conn.flush().await?;
        self.state = State::Finished;
        Ok(())
    }

    /// The connection back, if the exchange completed cleanly and may continue.
    pub fn into_reusable(self) -> Option<ClientConn> {
        match (self.state, self.sink) {
            (State::Finished, Sink::Conn(conn)) if self.keep_alive => conn,
            _ => None,
        }
    }

    /// The connection, for the caller to close after an unreusable exchange.
    pub fn into_conn(self) -> Option<ClientConn> {
        match self.sink {
            Sink::Conn(conn) => conn,
            Sink::Recorder(_) => None,
        }
    }
}
