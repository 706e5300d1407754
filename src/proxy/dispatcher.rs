//! Filter-to-plugin dispatch.
//!
//! # Responsibilities
//! - Cross-check every plugin a filter can select against the registry
//! - Run the first matching request plugin, then at most one response plugin
//! - Turn plugin errors into a 502 while the client can still receive one
//!
//! # Design Decisions
//! - Unknown plugin names fail at construction, never per request
//! - No request filter match means nothing is written at all

use http::Response;
use thiserror::Error;

use crate::config::ProxyConfig;
use crate::filter::{FilterChain, FilterError};
use crate::http::{bad_gateway, ProxyBody, ProxyRequest, ResponseWriter};
use crate::observability::metrics;
use crate::plugin::{Plugin, PluginError, PluginRegistry};
use crate::proxy::context::PluginContext;
use crate::proxy::handler::Handler;

/// Problems with the filter/plugin wiring detected at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("filter {filter} selects unknown plugin '{plugin}'")]
    UnknownPlugin { filter: String, plugin: String },

    #[error("response filter {filter} selects plugin '{plugin}', which has no response stage")]
    NoResponseStage { filter: String, plugin: String },

    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),
}

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// No request filter matched; nothing was written.
    Unmatched,
    /// A plugin handled the request.
    Handled,
    /// A plugin failed; a 502 was written if still possible.
    Failed,
}

/// A validated filter chain and the plugins it selects.
#[derive(Debug)]
pub struct Dispatcher {
    chain: FilterChain,
    registry: PluginRegistry,
}

impl Dispatcher {
    pub fn new(chain: FilterChain, registry: PluginRegistry) -> Result<Self, SetupError> {
        for filter in chain.request_filters() {
            for plugin in filter.plugins() {
                if !registry.contains(&plugin) {
                    return Err(SetupError::UnknownPlugin {
                        filter: filter.name().to_string(),
                        plugin,
                    });
                }
            }
        }
        for filter in chain.response_filters() {
            for plugin in filter.plugins() {
                match registry.get(&plugin) {
                    None => {
                        return Err(SetupError::UnknownPlugin {
                            filter: filter.name().to_string(),
                            plugin,
                        })
                    }
                    Some(p) if !p.handles_responses() => {
                        return Err(SetupError::NoResponseStage {
                            filter: filter.name().to_string(),
                            plugin,
                        })
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(Self { chain, registry })
    }

    /// Build the configured filter chain over `registry`.
    pub fn from_config(config: &ProxyConfig, registry: PluginRegistry) -> Result<Self, SetupError> {
        let chain = FilterChain::from_config(&config.request_filters, &config.response_filters)?;
        Self::new(chain, registry)
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Run one request through the filters and the selected plugins.
    pub async fn dispatch(&self, handler: &Handler, rw: &mut ResponseWriter, req: ProxyRequest) -> Dispatch {
        let Some(selection) = self.chain.select_request(&req) else {
            tracing::debug!(
                remote = %req.conn.remote_addr,
                method = %req.method,
                target = %req.target(),
                "No filter matched; closing connection"
            );
            metrics::record_dispatch("none", "unmatched");
            return Dispatch::Unmatched;
        };
        let Some(plugin) = self.registry.get(&selection.plugin).cloned() else {
            // Ruled out by `Dispatcher::new`.
            let err = PluginError::Unknown(selection.plugin.clone());
            return self.fail(rw, &req, &selection.plugin, err).await;
        };

        let result = {
            let ctx = PluginContext::new(handler, selection.args);
            plugin.handle_request(&ctx, rw, &req).await
        };

        match result {
            Ok(None) => {
                metrics::record_dispatch(plugin.name(), "handled");
                Dispatch::Handled
            }
            Ok(Some(response)) => self.respond(handler, rw, &req, plugin.as_ref(), response).await,
            Err(err) => self.fail(rw, &req, plugin.name(), err).await,
        }
    }

    async fn respond(
        &self,
        handler: &Handler,
        rw: &mut ResponseWriter,
        req: &ProxyRequest,
        origin: &dyn Plugin,
        response: Response<ProxyBody>,
    ) -> Dispatch {
        if !rw.is_writable() {
            tracing::warn!(plugin = origin.name(), "Plugin returned a response after writing; dropping it");
            return Dispatch::Handled;
        }

        let selected = self
            .chain
            .select_response(req, &response)
            .and_then(|s| self.registry.get(&s.plugin).cloned().map(|p| (p, s.args)));

        let outcome = match selected {
            Some((plugin, args)) => {
                let ctx = PluginContext::new(handler, args);
                plugin
                    .handle_response(&ctx, rw, req, response)
                    .await
                    .map_err(|e| (plugin.name().to_string(), e))
            }
            None => rw
                .send(response)
                .await
                .map_err(|e| (origin.name().to_string(), PluginError::from(e))),
        };

        match outcome {
            Ok(()) => {
                metrics::record_dispatch(origin.name(), "handled");
                Dispatch::Handled
            }
            Err((plugin, err)) => self.fail(rw, req, &plugin, err).await,
        }
    }

    async fn fail(&self, rw: &mut ResponseWriter, req: &ProxyRequest, plugin: &str, err: PluginError) -> Dispatch {
        metrics::record_plugin_error(plugin);
        metrics::record_dispatch(plugin, "failed");

        if !rw.is_writable() {
            tracing::warn!(
                remote = %req.conn.remote_addr,
                plugin,
                target = %req.target(),
                error = %err,
                "Plugin failed after the response started"
            );
            return Dispatch::Failed;
        }

        tracing::warn!(
            remote = %req.conn.remote_addr,
            plugin,
            target = %req.target(),
            error = %err,
            "Plugin failed; replying 502"
        );
        if let Err(e) = rw.send(bad_gateway(&err)).await {
            tracing::debug!(error = %e, "Failed to write 502");
        }
        Dispatch::Failed
    }
}
