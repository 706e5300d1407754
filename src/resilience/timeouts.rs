//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap dial, handshake and round-trip futures with a deadline
//! - Keep timeout errors distinct from other network errors

use std::future::Future;
use std::time::Duration;

use crate::network::NetworkError;

/// Run `fut` with a deadline, mapping expiry to [`NetworkError::Timeout`].
pub async fn deadline<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T, NetworkError>
where
    F: Future<Output = Result<T, NetworkError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::Timeout { op, after }),
    }
}
