//! Exponential backoff for retrying failed accepts.

use std::time::Duration;

/// First delay after a transient accept error.
pub const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Upper bound on the accept retry delay.
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Calculate the exponential backoff delay for `attempt` (1-based).
///
/// The delay doubles with every attempt and never exceeds `max`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential_base = 2u32.saturating_pow(attempt - 1);
    base.saturating_mul(exponential_base).min(max)
}

/// Stateful backoff used by the listener's accept loop.
#[derive(Debug, Clone)]
pub struct AcceptBackoff {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::with_bounds(ACCEPT_BACKOFF_BASE, ACCEPT_BACKOFF_MAX)
    }

    pub fn with_bounds(base: Duration, max: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            max,
        }
    }

    /// Delay to wait before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        calculate_backoff(self.attempt, self.base, self.max)
    }

    /// Forget previous failures after a successful accept.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self::new()
    }
}
