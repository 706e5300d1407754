//! Self-feeding TCP listener.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Run one background task that natively accepts and enqueues connections
//! - Back off on transient accept errors, stop producing on fatal ones
//! - Let plugins push connections (e.g. decrypted TLS) into the same queue
//!
//! # Design Decisions
//! - A single bounded FIFO holds native and pushed entries alike, so `accept`
//!   cannot tell them apart and ordering is strictly arrival order
//! - Pushers hold a sender clone, never the listener or the server
//! - A full queue applies backpressure to both the accept task and pushers

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::ListenerConfig;
use crate::net::connection::{Accepted, ConnectionInfo};
use crate::observability::metrics;
use crate::resilience::backoff::AcceptBackoff;

/// Default number of queued, not yet served, connections.
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

/// One queue entry: a connection or the error the native accept produced.
pub type AcceptResult = io::Result<Accepted>;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(std::io::Error),
    /// Queue capacity must be non-zero.
    Capacity,
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(e) => write!(f, "Failed to bind: {}", e),
            ListenerError::Capacity => write!(f, "Listener queue capacity must be greater than zero"),
        }
    }
}

impl std::error::Error for ListenerError {}

/// Source of natively accepted connections.
pub trait AcceptSource: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = AcceptResult> + Send;
}

impl AcceptSource for TcpListener {
    async fn accept(&mut self) -> AcceptResult {
        let (stream, peer) = TcpListener::accept(self).await?;
        // Nagle only delays small proxy writes such as the tunnel acknowledgement.
        let _ = stream.set_nodelay(true);
        Ok(Accepted::new(stream, ConnectionInfo::plain(peer)))
    }
}

/// Returns true for accept errors worth retrying.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(
        err.raw_os_error(),
        // ENOMEM, ENFILE, EMFILE, ENOBUFS
        Some(12) | Some(23) | Some(24) | Some(105)
    )
}

/// Handle for injecting connections into a [`PushListener`].
#[derive(Debug, Clone)]
pub struct Pusher {
    tx: mpsc::Sender<AcceptResult>,
}

impl Pusher {
    /// Enqueue an entry at the tail of the accept queue.
    ///
    /// Waits while the queue is full.
    pub async fn push(&self, entry: AcceptResult) {
        if self.tx.send(entry).await.is_err() {
            tracing::debug!("Listener dropped; pushed connection discarded");
        }
    }
}

/// A listener whose accept queue can be fed from inside the proxy.
pub struct PushListener {
    local_addr: SocketAddr,
    pusher: Pusher,
    queue: Mutex<mpsc::Receiver<AcceptResult>>,
    producer: JoinHandle<()>,
}

impl PushListener {
    /// Bind to the configured address and start accepting.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| ListenerError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            queue_capacity = config.queue_capacity,
            "Listener bound"
        );

        Self::from_source(listener, local_addr, config.queue_capacity)
    }

    /// Build a listener over any accept source.
    pub fn from_source<S: AcceptSource>(
        source: S,
        local_addr: SocketAddr,
        capacity: usize,
    ) -> Result<Self, ListenerError> {
        if capacity == 0 {
            return Err(ListenerError::Capacity);
        }
        let (tx, rx) = mpsc::channel(capacity);
        let producer = tokio::spawn(accept_loop(source, tx.clone()));

        Ok(Self {
            local_addr,
            pusher: Pusher { tx },
            queue: Mutex::new(rx),
            producer,
        })
    }

    /// Wait for the next connection, in arrival/push order.
    ///
    /// Blocks forever once the producer has stopped and the queue is drained.
    pub async fn accept(&self) -> AcceptResult {
        let mut queue = self.queue.lock().await;
        match queue.recv().await {
            Some(entry) => entry,
            // Unreachable while `self.pusher` holds a sender.
            None => std::future::pending().await,
        }
    }

    /// Enqueue a connection as if it had been natively accepted.
    pub async fn push(&self, entry: AcceptResult) {
        self.pusher.push(entry).await;
    }

    /// A cloneable handle that can push without borrowing the listener.
    pub fn pusher(&self) -> Pusher {
        self.pusher.clone()
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the native accept task is still producing.
    pub fn is_producing(&self) -> bool {
        !self.producer.is_finished()
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

async fn accept_loop<S: AcceptSource>(mut source: S, tx: mpsc::Sender<AcceptResult>) {
    let mut backoff = AcceptBackoff::new();
    loop {
        let entry = source.accept().await;
        let failure = entry
            .as_ref()
            .err()
            .map(|e| (is_transient(e), e.to_string()));

        if tx.send(entry).await.is_err() {
            return;
        }

        match failure {
            None => backoff.reset(),
            Some((true, error)) => {
                let delay = backoff.next_delay();
                metrics::record_accept_error(true);
                tracing::warn!(error = %error, retry_in = ?delay, "Accept error; retrying");
                tokio::time::sleep(delay).await;
            }
            Some((false, error)) => {
                metrics::record_accept_error(false);
                tracing::error!(error = %error, "Accept failed; listener stopped producing");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Replays scripted accept outcomes, then parks forever.
    struct Scripted {
        steps: VecDeque<io::Result<u16>>,
        accepted_at: std::sync::Arc<std::sync::Mutex<Vec<Instant>>>,
    }

    impl AcceptSource for Scripted {
        async fn accept(&mut self) -> AcceptResult {
            match self.steps.pop_front() {
                Some(step) => {
                    self.accepted_at.lock().unwrap().push(Instant::now());
                    step.map(pipe)
                }
                None => std::future::pending().await,
            }
        }
    }

    fn pipe(port: u16) -> Accepted {
        let (a, _b) = tokio::io::duplex(16);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        Accepted::new(a, ConnectionInfo::plain(addr))
    }

    fn scripted(steps: Vec<io::Result<u16>>) -> (Scripted, std::sync::Arc<std::sync::Mutex<Vec<Instant>>>) {
        let times = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        (
            Scripted {
                steps: steps.into(),
                accepted_at: times.clone(),
            },
            times,
        )
    }

    fn local() -> SocketAddr {
        "127.0.0.1:1080".parse().unwrap()
    }

    fn port_of(entry: AcceptResult) -> u16 {
        entry.unwrap().info.remote_addr.port()
    }

    #[tokio::test]
    async fn pushed_and_native_entries_share_fifo_order() {
        let (source, _) = scripted(vec![Ok(1)]);
        let listener = PushListener::from_source(source, local(), 8).unwrap();

        // Let the producer enqueue the native connection first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.push(Ok(pipe(2))).await;
        listener.pusher().push(Ok(pipe(3))).await;

        assert_eq!(port_of(listener.accept().await), 1);
        assert_eq!(port_of(listener.accept().await), 2);
        assert_eq!(port_of(listener.accept().await), 3);
    }

    #[tokio::test]
    async fn pushed_connection_is_accepted_exactly_once() {
        let (source, _) = scripted(vec![]);
        let listener = PushListener::from_source(source, local(), 4).unwrap();
        listener.push(Ok(pipe(9))).await;

        assert_eq!(port_of(listener.accept().await), 9);
        let again = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(again.is_err(), "queue should be empty");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_exponentially() {
        let transient = || Err(io::Error::from(io::ErrorKind::ConnectionAborted));
        let (source, times) = scripted(vec![transient(), transient(), transient(), Ok(7)]);
        let listener = PushListener::from_source(source, local(), 8).unwrap();

        for _ in 0..3 {
            assert!(listener.accept().await.is_err());
        }
        assert_eq!(port_of(listener.accept().await), 7);

        let times = times.lock().unwrap().clone();
        let gaps: Vec<u128> = times.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        for (gap, expected) in gaps.iter().zip([5u128, 10, 20]) {
            assert!(*gap >= expected && *gap <= expected + 1, "gaps were {:?}", gaps);
        }
    }

    #[tokio::test]
    async fn fatal_error_stops_producer_but_queue_drains() {
        let fatal = Err(io::Error::new(io::ErrorKind::InvalidInput, "listener closed"));
        let (source, _) = scripted(vec![Ok(1), fatal, Ok(2)]);
        let listener = PushListener::from_source(source, local(), 8).unwrap();

        assert_eq!(port_of(listener.accept().await), 1);
        assert!(listener.accept().await.is_err());

        let next = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(next.is_err(), "no entries after a fatal accept error");
        assert!(!listener.is_producing());
    }

    #[test]
    fn classifies_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[tokio::test]
    async fn zero_capacity_is_rejected() {
        let (source, _) = scripted(vec![]);
        assert!(matches!(
            PushListener::from_source(source, local(), 0),
            Err(ListenerError::Capacity)
        ));
    }
}
