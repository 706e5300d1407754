//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::net::listener::DEFAULT_QUEUE_CAPACITY;
use crate::net::tls::ClientAuth;

/// Root configuration for the forward proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, queue, re-injection).
    pub listener: ListenerConfig,

    /// Upstream networking.
    pub network: NetworkConfig,

    /// TLS interception settings.
    pub interception: InterceptionConfig,

    /// CONNECT tunnel settings.
    pub tunnel: TunnelConfig,

    /// Request size and time limits.
    pub limits: LimitsConfig,

    /// Request filters, evaluated in order; first match wins.
    pub request_filters: Vec<FilterRuleConfig>,

    /// Response filters, evaluated in order; first match wins.
    pub response_filters: Vec<FilterRuleConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            network: NetworkConfig::default(),
            interception: InterceptionConfig::default(),
            tunnel: TunnelConfig::default(),
            limits: LimitsConfig::default(),
            request_filters: vec![FilterRuleConfig::catch_all("direct", "direct")],
            response_filters: vec![FilterRuleConfig::catch_all("direct", "direct")],
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:1080").
    pub bind_address: String,

    /// Accepted connections queued before the accept task blocks.
    pub queue_capacity: usize,

    /// How decrypted connections get back into the server.
    pub reinject: ReinjectMode,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:1080".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reinject: ReinjectMode::Push,
        }
    }
}

/// Re-injection mode for intercepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReinjectMode {
    /// Push the decrypted stream straight into the listener queue.
    #[default]
    Push,
    /// Dial the proxy's own listening address and splice.
    Loopback,
}

/// Upstream network configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Timeout for dials, TLS handshakes and round trips.
    pub timeout_secs: u64,

    /// `host:port` → `host:port` rewrites applied when dialing.
    pub aliases: HashMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 8,
            aliases: HashMap::new(),
        }
    }
}

/// TLS interception configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InterceptionConfig {
    /// Directory holding per-host PEM certificates.
    pub cert_dir: String,

    /// Client certificate policy for intercepted handshakes.
    pub client_auth: ClientAuth,
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self {
            cert_dir: "./certs".to_string(),
            client_auth: ClientAuth::Optional,
        }
    }
}

/// Tunnel configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Close a tunnel after this long without traffic in one direction (0 = never).
    pub idle_timeout_secs: u64,
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted request head.
    pub max_header_bytes: usize,

    /// Largest accepted request body.
    pub max_body_bytes: usize,

    /// Time allowed to read a complete request, including keep-alive idle time.
    pub header_read_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 1024 * 1024,
            max_body_bytes: 10 * 1024 * 1024,
            header_read_timeout_secs: 10,
        }
    }
}

/// A config-driven filter rule.
///
/// Conditions are ANDed; an empty condition matches everything.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterRuleConfig {
    /// Name used in logs.
    pub name: String,

    /// Plugin selected when the rule matches.
    pub plugin: String,

    /// Request methods (e.g., "CONNECT").
    pub methods: Vec<String>,

    /// Hosts; a leading dot matches the domain and all subdomains.
    pub hosts: Vec<String>,

    /// Response status codes (response filters only).
    pub statuses: Vec<u16>,

    /// Arguments handed to the plugin.
    pub args: BTreeMap<String, String>,
}

impl FilterRuleConfig {
    pub fn catch_all(name: &str, plugin: &str) -> Self {
        Self {
            name: name.to_string(),
            plugin: plugin.to_string(),
            ..Self::default()
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log destination ("stderr" or "stdout").
    pub log_target: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_target: "stderr".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
