//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection (native or pushed)
//!     → server.rs (per-connection task, keep-alive loop)
//!     → request.rs (parse head and body off conn.rs buffer)
//!     → proxy handler (filters select a plugin)
//!     → response.rs (write response, or hijack the raw stream)
//! ```

pub mod conn;
pub mod request;
pub mod response;
pub mod server;

pub use request::{ProxyRequest, RequestError};
pub use response::{bad_gateway, full_body, HijackError, Hijacked, ProxyBody, ResponseWriter, WriteError};
pub use server::HttpServer;
