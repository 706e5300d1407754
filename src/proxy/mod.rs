//! Proxy core.
//!
//! # Data Flow
//! ```text
//! ProxyRequest + ResponseWriter
//!     → handler.rs (network provider, re-injection mode)
//!     → dispatcher.rs (filter chain → plugin → response filter)
//!     → context.rs (what the selected plugin may reach)
//! ```

pub mod context;
pub mod dispatcher;
pub mod handler;

pub use context::PluginContext;
pub use dispatcher::{Dispatch, Dispatcher, SetupError};
pub use handler::{Handler, Reinjection};
