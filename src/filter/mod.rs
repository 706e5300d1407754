//! Filter subsystem.
//!
//! # Data Flow
//! ```text
//! Parsed request
//!     → chain.rs request filters (first match wins)
//!     → Selection { plugin, args } or nothing
//!
//! Plugin response
//!     → chain.rs response filters (first match wins)
//!     → Selection of a response plugin, or write verbatim
//! ```
//!
//! # Design Decisions
//! - Filters are pure decision functions
//! - Config rules are built from matcher.rs conditions

pub mod chain;
pub mod matcher;

pub use chain::{FilterChain, FilterError, FilterResult, PluginArgs, RequestFilter, ResponseFilter, Selection};
