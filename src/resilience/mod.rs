//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Native accept fails transiently:
//!     → backoff.rs (5ms doubling to 1s, reset on success)
//!
//! Dial / TLS handshake / round trip:
//!     → timeouts.rs (deadline from the network provider)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every upstream call has a deadline
//! - Accept backoff has no jitter: there is a single producer per listener

pub mod backoff;
pub mod timeouts;
