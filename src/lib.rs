//! Forward HTTP proxy library.

pub mod config;
pub mod filter;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod network;
pub mod observability;
pub mod plugin;
pub mod proxy;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
