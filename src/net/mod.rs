//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept task, backoff, bounded queue)
//!     → connection.rs (id, boxed stream, tracking)
//!     → Hand off to HTTP layer
//!
//! Intercepted tunnel
//!     → tls.rs (per-host certificate, server handshake config)
//!     → listener.rs push (decrypted stream re-enters the queue)
//!
//! Hijacked connection
//!     → splice.rs (one copy task per direction)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Natively accepted and pushed connections are indistinguishable downstream
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod listener;
pub mod splice;
pub mod tls;

pub use connection::{Accepted, BoxedStream, ConnectionId, ConnectionInfo, TlsInfo};
pub use listener::{PushListener, Pusher};
