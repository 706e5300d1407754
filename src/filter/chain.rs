//! Ordered request and response filters.
//!
//! # Responsibilities
//! - Decide which plugin, if any, handles a request or post-processes a response
//! - Build rule filters from configuration
//! - Report every plugin name a filter can select, for startup validation
//!
//! # Design Decisions
//! - First match wins; an empty selection means "no opinion"
//! - A filter error is logged but its selection is still honored
//! - Filters are pure decisions and never touch the connection

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Response, StatusCode};
use thiserror::Error;

use crate::config::FilterRuleConfig;
use crate::filter::matcher::{AndMatcher, HostMatcher, Matcher, MethodMatcher};
use crate::http::{ProxyBody, ProxyRequest};

/// Arguments a filter hands to the plugin it selects.
pub type PluginArgs = HeaderMap;

/// Error reported by a filter alongside its decision.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("filter {filter}: {message}")]
pub struct FilterError {
    pub filter: String,
    pub message: String,
}

impl FilterError {
    pub fn new(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            message: message.into(),
        }
    }
}

/// A plugin chosen by a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub plugin: String,
    pub args: PluginArgs,
}

/// Outcome of running one filter.
#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    pub selection: Option<Selection>,
    pub error: Option<FilterError>,
}

impl FilterResult {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn select(plugin: impl Into<String>, args: PluginArgs) -> Self {
        Self {
            selection: Some(Selection {
                plugin: plugin.into(),
                args,
            }),
            error: None,
        }
    }
}

/// Chooses the plugin that handles a request.
pub trait RequestFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Every plugin name this filter can select.
    fn plugins(&self) -> Vec<String>;

    fn filter(&self, req: &ProxyRequest) -> FilterResult;
}

/// Chooses the plugin that post-processes and writes a response.
pub trait ResponseFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Every plugin name this filter can select.
    fn plugins(&self) -> Vec<String>;

    fn filter(&self, req: &ProxyRequest, response: &Response<ProxyBody>) -> FilterResult;
}

/// Selects a fixed plugin when its method and host conditions match.
#[derive(Debug)]
pub struct RuleFilter {
    name: String,
    plugin: String,
    matcher: AndMatcher,
    args: PluginArgs,
}

impl RuleFilter {
    pub fn new(name: impl Into<String>, plugin: impl Into<String>, matcher: AndMatcher, args: PluginArgs) -> Self {
        Self {
            name: name.into(),
            plugin: plugin.into(),
            matcher,
            args,
        }
    }

    pub fn from_config(rule: &FilterRuleConfig) -> Result<Self, FilterError> {
        let name = if rule.name.is_empty() { rule.plugin.clone() } else { rule.name.clone() };
        let invalid = |message: String| FilterError::new(name.clone(), message);

        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if !rule.methods.is_empty() {
            let methods = rule
                .methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|_| invalid(format!("invalid method '{m}'")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            matchers.push(Box::new(MethodMatcher::new(methods)));
        }
        if !rule.hosts.is_empty() {
            matchers.push(Box::new(HostMatcher::new(rule.hosts.clone())));
        }

        let mut args = PluginArgs::new();
        for (key, value) in &rule.args {
            let key = HeaderName::from_bytes(key.as_bytes()).map_err(|_| invalid(format!("invalid argument '{key}'")))?;
            let value = HeaderValue::from_str(value).map_err(|_| invalid(format!("invalid value for '{key}'")))?;
            args.append(key, value);
        }

        Ok(Self::new(name.clone(), rule.plugin.clone(), AndMatcher::new(matchers), args))
    }

    fn decide(&self, req: &ProxyRequest) -> FilterResult {
        if self.matcher.matches(req) {
            FilterResult::select(self.plugin.clone(), self.args.clone())
        } else {
            FilterResult::none()
        }
    }
}

impl RequestFilter for RuleFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugins(&self) -> Vec<String> {
        vec![self.plugin.clone()]
    }

    fn filter(&self, req: &ProxyRequest) -> FilterResult {
        self.decide(req)
    }
}

/// A [`RuleFilter`] that can also require particular response statuses.
#[derive(Debug)]
pub struct ResponseRuleFilter {
    rule: RuleFilter,
    statuses: Vec<StatusCode>,
}

impl ResponseRuleFilter {
    pub fn from_config(rule: &FilterRuleConfig) -> Result<Self, FilterError> {
        let inner = RuleFilter::from_config(rule)?;
        let statuses = rule
            .statuses
            .iter()
            .map(|s| {
                StatusCode::from_u16(*s).map_err(|_| FilterError::new(inner.name.clone(), format!("invalid status {s}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rule: inner, statuses })
    }
}

impl ResponseFilter for ResponseRuleFilter {
    fn name(&self) -> &str {
        &self.rule.name
    }

    fn plugins(&self) -> Vec<String> {
        self.rule.plugins()
    }

    fn filter(&self, req: &ProxyRequest, response: &Response<ProxyBody>) -> FilterResult {
        if !self.statuses.is_empty() && !self.statuses.contains(&response.status()) {
            return FilterResult::none();
        }
        self.rule.decide(req)
    }
}

/// Ordered request and response filters.
#[derive(Default)]
pub struct FilterChain {
    request: Vec<Box<dyn RequestFilter>>,
    response: Vec<Box<dyn ResponseFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(request: &[FilterRuleConfig], response: &[FilterRuleConfig]) -> Result<Self, FilterError> {
        let mut chain = Self::new();
        for rule in request {
            chain = chain.with_request_filter(RuleFilter::from_config(rule)?);
        }
        for rule in response {
            chain = chain.with_response_filter(ResponseRuleFilter::from_config(rule)?);
        }
        Ok(chain)
    }

    pub fn with_request_filter(mut self, filter: impl RequestFilter + 'static) -> Self {
        self.request.push(Box::new(filter));
        self
    }

    pub fn with_response_filter(mut self, filter: impl ResponseFilter + 'static) -> Self {
        self.response.push(Box::new(filter));
        self
    }

    pub fn request_filters(&self) -> &[Box<dyn RequestFilter>] {
        &self.request
    }

    pub fn response_filters(&self) -> &[Box<dyn ResponseFilter>] {
        &self.response
    }

    /// First request filter selection, in order.
    pub fn select_request(&self, req: &ProxyRequest) -> Option<Selection> {
        self.request
            .iter()
            .find_map(|f| first_selection(f.name(), f.filter(req)))
    }

    /// First response filter selection, in order.
    pub fn select_response(&self, req: &ProxyRequest, response: &Response<ProxyBody>) -> Option<Selection> {
        self.response
            .iter()
            .find_map(|f| first_selection(f.name(), f.filter(req, response)))
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let request: Vec<&str> = self.request.iter().map(|f| f.name()).collect();
        let response: Vec<&str> = self.response.iter().map(|f| f.name()).collect();
        f.debug_struct("FilterChain")
            .field("request", &request)
            .field("response", &response)
            .finish()
    }
}

fn first_selection(filter: &str, result: FilterResult) -> Option<Selection> {
    if let Some(err) = result.error {
        tracing::warn!(filter, error = %err, "Filter reported an error");
    }
    let selection = result.selection?;
    tracing::trace!(filter, plugin = %selection.plugin, "Filter matched");
    Some(selection)
}
