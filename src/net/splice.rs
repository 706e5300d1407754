//! Bidirectional byte splicing between two live connections.
//!
//! One task copies each direction. The splice ends as soon as either direction
//! finishes or fails, or when neither direction has moved a byte for the idle
//! limit; the remaining copy tasks are then aborted.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Why the splice stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceEnd {
    /// `a` → `b` finished first.
    Forward,
    /// `b` → `a` finished first.
    Backward,
    /// No bytes in either direction for the idle limit.
    Idle,
}

/// Last time either direction carried data.
#[derive(Debug)]
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn quiet_for(&self) -> Duration {
        let last = self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }
}

/// Copy bytes between `a` and `b` until one side closes, errors, or the pair idles out.
///
/// `idle` is measured across both directions, so a one-way transfer keeps the
/// splice alive; `None` means no deadline.
pub async fn splice<A, B>(a: A, b: B, idle: Option<Duration>) -> SpliceEnd
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let activity = Arc::new(Activity::new());

    let mut forward = tokio::spawn(copy_half(a_read, b_write, activity.clone()));
    let mut backward = tokio::spawn(copy_half(b_read, a_write, activity.clone()));

    let watchdog = async {
        match idle {
            Some(limit) => wait_idle(&activity, limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let (end, result, other) = tokio::select! {
        result = &mut forward => (SpliceEnd::Forward, result, backward),
        result = &mut backward => (SpliceEnd::Backward, result, forward),
        _ = watchdog => {
            forward.abort();
            backward.abort();
            tracing::debug!(idle = ?idle, "Splice idle timeout");
            return SpliceEnd::Idle;
        }
    };
    other.abort();

    match result {
        Ok(Ok(bytes)) => tracing::debug!(direction = ?end, bytes, "Splice closed"),
        Ok(Err(e)) => tracing::debug!(direction = ?end, error = %e, "Splice ended with error"),
        Err(e) => tracing::debug!(direction = ?end, error = %e, "Splice task failed"),
    }
    end
}

async fn wait_idle(activity: &Activity, limit: Duration) {
    loop {
        let quiet = activity.quiet_for();
        if quiet >= limit {
            return;
        }
        tokio::time::sleep(limit - quiet).await;
    }
}

async fn copy_half<R, W>(mut reader: R, mut writer: W, activity: Arc<Activity>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_both_directions_until_close() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (upstream, mut upstream_peer) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(client, upstream, None));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(upstream_peer);
        assert_eq!(task.await.unwrap(), SpliceEnd::Backward);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_ends_splice() {
        let (client, _client_peer) = tokio::io::duplex(64);
        let (upstream, _upstream_peer) = tokio::io::duplex(64);

        let end = tokio::time::timeout(
            Duration::from_secs(60),
            splice(client, upstream, Some(Duration::from_secs(5))),
        )
        .await;
        assert_eq!(end.unwrap(), SpliceEnd::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn one_way_transfer_keeps_splice_alive() {
        let (client, mut client_peer) = tokio::io::duplex(64);
        let (upstream, mut upstream_peer) = tokio::io::duplex(64);

        let task = tokio::spawn(splice(client, upstream, Some(Duration::from_secs(5))));
        let feeder = tokio::spawn(async move {
            for _ in 0..20 {
                upstream_peer.write_all(b"x").await.unwrap();
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            // Stay open but silent so only the idle limit can end the splice.
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(upstream_peer);
        });

        let mut received = [0u8; 20];
        client_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, &[b'x'; 20]);

        assert_eq!(task.await.unwrap(), SpliceEnd::Idle);
        feeder.abort();
    }
}
