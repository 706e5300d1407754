//! Buffered client connection shared by the request reader and the response writer.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::net::{Accepted, BoxedStream, ConnectionInfo};

const READ_CHUNK: usize = 8 * 1024;

/// A client connection plus bytes read from it but not yet consumed.
pub struct ClientConn {
    stream: BoxedStream,
    buf: BytesMut,
    info: ConnectionInfo,
}

impl ClientConn {
    pub fn new(accepted: Accepted) -> Self {
        Self {
            stream: accepted.stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            info: accepted.info,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Unconsumed read-ahead bytes.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Read more bytes into the buffer. Returns 0 at EOF.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.stream.read_buf(&mut self.buf).await
    }

    /// Like [`fill`](Self::fill), failing with `TimedOut` if no bytes arrive within `idle`.
    pub async fn fill_within(&mut self, idle: Duration) -> io::Result<usize> {
        match tokio::time::timeout(idle, self.fill()).await {
            Ok(read) => read,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }

    /// Fill until at least `n` bytes are buffered, allowing `idle` between reads.
    pub async fn fill_to(&mut self, n: usize, idle: Duration) -> io::Result<()> {
        while self.buf.len() < n {
            if self.fill_within(idle).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        Ok(())
    }

    /// Remove and return the first `n` buffered bytes.
    pub fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Give up buffering; the caller owns the raw stream and the read-ahead.
    pub fn into_parts(self) -> (BoxedStream, Bytes, ConnectionInfo) {
        (self.stream, self.buf.freeze(), self.info)
    }
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("info", &self.info)
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}
