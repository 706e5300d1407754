//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse)
//! - Check filter rules are well formed
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Plugin names are checked later against the registry, which lives in code

use std::net::SocketAddr;

use http::Method;

use crate::config::schema::{FilterRuleConfig, ProxyConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.queue_capacity == 0 {
        errors.push(ValidationError::new("listener.queue_capacity", "must be greater than zero"));
    }

    if config.network.timeout_secs == 0 {
        errors.push(ValidationError::new("network.timeout_secs", "must be greater than zero"));
    }
    for (from, to) in &config.network.aliases {
        if !to.contains(':') {
            errors.push(ValidationError::new(
                format!("network.aliases.{from}"),
                format!("'{to}' must be host:port"),
            ));
        }
    }

    if config.interception.cert_dir.trim().is_empty() {
        errors.push(ValidationError::new("interception.cert_dir", "must not be empty"));
    }

    if config.limits.max_header_bytes == 0 {
        errors.push(ValidationError::new("limits.max_header_bytes", "must be greater than zero"));
    }
    if config.limits.header_read_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "limits.header_read_timeout_secs",
            "must be greater than zero",
        ));
    }

    if config.request_filters.is_empty() {
        errors.push(ValidationError::new(
            "request_filters",
            "at least one filter is required; unmatched requests are dropped",
        ));
    }
    for (i, rule) in config.request_filters.iter().enumerate() {
        let field = format!("request_filters[{i}]");
        validate_rule(&field, rule, &mut errors);
        if !rule.statuses.is_empty() {
            errors.push(ValidationError::new(
                format!("{field}.statuses"),
                "only response filters can match on status",
            ));
        }
    }
    for (i, rule) in config.response_filters.iter().enumerate() {
        validate_rule(&format!("response_filters[{i}]"), rule, &mut errors);
    }

    match config.observability.log_target.as_str() {
        "stderr" | "stdout" => {}
        other => errors.push(ValidationError::new(
            "observability.log_target",
            format!("'{other}' is not one of stderr, stdout"),
        )),
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_rule(field: &str, rule: &FilterRuleConfig, errors: &mut Vec<ValidationError>) {
    if rule.plugin.trim().is_empty() {
        errors.push(ValidationError::new(format!("{field}.plugin"), "must not be empty"));
    }
    for method in &rule.methods {
        if Method::from_bytes(method.as_bytes()).is_err() {
            errors.push(ValidationError::new(
                format!("{field}.methods"),
                format!("'{method}' is not an HTTP method"),
            ));
        }
    }
    for host in &rule.hosts {
        if host.trim_start_matches('.').is_empty() {
            errors.push(ValidationError::new(format!("{field}.hosts"), "empty host pattern"));
        }
    }
    for status in &rule.statuses {
        if !(100..=999).contains(status) {
            errors.push(ValidationError::new(
                format!("{field}.statuses"),
                format!("{status} is not a status code"),
            ));
        }
    }
    for name in rule.args.keys() {
        if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(ValidationError::new(
                format!("{field}.args"),
                format!("'{name}' is not a valid argument name"),
            ));
        }
    }
}
