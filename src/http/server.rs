//! HTTP/1.1 server over the self-feeding listener.
//!
//! # Responsibilities
//! - Pull connections off the listener queue until shutdown
//! - Run one task per connection with a keep-alive request loop
//! - Reject malformed requests, dispatch the rest to the [`Handler`]
//!
//! # Design Decisions
//! - Connections pushed back by plugins arrive through the same queue and are
//!   served by the same loop as native ones
//! - An unmatched request closes the connection without writing anything

use std::net::SocketAddr;
use std::sync::Arc;

use http::{Method, StatusCode, Version};
use tokio::sync::broadcast;

use crate::config::LimitsConfig;
use crate::http::conn::ClientConn;
use crate::http::request::{read_request, RequestError};
use crate::http::response::{plain_response, ResponseWriter};
use crate::net::connection::ConnectionTracker;
use crate::net::{Accepted, PushListener};
use crate::proxy::{Dispatch, Handler};

/// Serves proxy requests from a [`PushListener`].
pub struct HttpServer {
    handler: Arc<Handler>,
    listener: Arc<PushListener>,
    limits: LimitsConfig,
    tracker: ConnectionTracker,
}

impl HttpServer {
    pub fn new(handler: Arc<Handler>, listener: Arc<PushListener>, limits: LimitsConfig) -> Self {
        Self {
            handler,
            listener,
            limits,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Handle for draining in-flight connections after `run` returns.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept and serve connections until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(address = %self.local_addr(), "HTTP server starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received; no longer accepting");
                    break;
                }
                entry = self.listener.accept() => match entry {
                    Ok(accepted) => self.spawn_connection(accepted),
                    // Already logged by the accept task.
                    Err(e) => tracing::debug!(error = %e, "Dequeued accept error"),
                },
            }
        }

        tracing::info!(active = self.tracker.active_count(), "HTTP server stopped");
    }

    fn spawn_connection(&self, accepted: Accepted) {
        let guard = self.tracker.track(accepted.info.id);
        let handler = Arc::clone(&self.handler);
        let limits = self.limits.clone();
        tokio::spawn(async move {
            serve_connection(handler, accepted, &limits).await;
            drop(guard);
        });
    }
}

/// Run the request loop for one connection.
pub async fn serve_connection(handler: Arc<Handler>, accepted: Accepted, limits: &LimitsConfig) {
    let info = accepted.info.clone();
    tracing::debug!(
        connection_id = %info.id,
        remote = %info.remote_addr,
        decrypted = info.is_tls(),
        "Serving connection"
    );

    let mut conn = ClientConn::new(accepted);

    loop {
        let request = match read_request(&mut conn, limits).await {
            Ok(None) => break,
            Ok(Some(request)) => request,
            Err(RequestError::HeadTimeout) => {
                tracing::debug!(connection_id = %info.id, "Request read timed out");
                break;
            }
            Err(RequestError::Io(e)) => {
                tracing::debug!(connection_id = %info.id, error = %e, "Client connection error");
                break;
            }
            Err(e) => {
                tracing::warn!(connection_id = %info.id, remote = %info.remote_addr, error = %e, "Rejecting request");
                reject(conn, &e).await;
                return;
            }
        };

        let keep_alive = !request.wants_close();
        let mut rw = ResponseWriter::for_conn(conn, &request.method, request.version, keep_alive);
        let outcome = handler.serve(&mut rw, request).await;

        if matches!(outcome, Dispatch::Unmatched) {
            close(rw.into_conn()).await;
            return;
        }
        conn = match rw.into_reusable() {
            Some(conn) => conn,
            // Hijacked connections are owned by the plugin.
            None => return,
        };
    }

    close(Some(conn)).await;
}

async fn reject(conn: ClientConn, err: &RequestError) {
    let status = match err {
        RequestError::HeadTooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        RequestError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        RequestError::BodyTimeout(_) => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::BAD_REQUEST,
    };
    let mut rw = ResponseWriter::for_conn(conn, &Method::GET, Version::HTTP_11, false);
    let text = format!("{}\n", status.canonical_reason().unwrap_or("Bad Request"));
    if let Err(e) = rw.send(plain_response(status, text)).await {
        tracing::debug!(error = %e, "Failed to write rejection");
    }
    close(rw.into_conn()).await;
}

async fn close(conn: Option<ClientConn>) {
    if let Some(mut conn) = conn {
        let _ = conn.shutdown().await;
    }
}
