//! Request matching logic.
//!
//! # Responsibilities
//! - Match the request method
//! - Match the target host (exact or domain suffix, case-insensitive)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Host matching is case-insensitive (per HTTP spec)
//! - The host comes from the CONNECT authority, the absolute URI, the Host
//!   header or the SNI of a decrypted connection, in that order
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

use http::Method;

use crate::http::ProxyRequest;

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, req: &ProxyRequest) -> bool;
}

/// Matches any of a set of methods.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    methods: Vec<Method>,
}

impl MethodMatcher {
    pub fn new(methods: Vec<Method>) -> Self {
        Self { methods }
    }
}

impl Matcher for MethodMatcher {
    fn matches(&self, req: &ProxyRequest) -> bool {
        self.methods.contains(&req.method)
    }
}

/// Matches the target host.
///
/// `example.com` matches only that host; `.example.com` matches it and every subdomain.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    patterns: Vec<String>,
}

impl HostMatcher {
    /// Patterns are normalized to lowercase for case-insensitive matching.
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    fn pattern_matches(pattern: &str, host: &str) -> bool {
        match pattern.strip_prefix('.') {
            Some(domain) => host == domain || host.ends_with(pattern),
            None => host == pattern,
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, req: &ProxyRequest) -> bool {
        req.host()
            .map(|host| self.patterns.iter().any(|p| Self::pattern_matches(p, &host)))
            .unwrap_or(false)
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug, Default)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &ProxyRequest) -> bool {
        // All matchers must pass (AND)
        self.matchers.iter().all(|m| m.matches(req))
    }
}
