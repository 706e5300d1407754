//! Per-dispatch plugin context.

use crate::filter::PluginArgs;
use crate::network::Network;
use crate::proxy::handler::{Handler, Reinjection};

/// What a plugin can reach while handling one request.
///
/// Borrows the handler and owns the selecting filter's arguments; it lives
/// only as long as the dispatch that created it.
pub struct PluginContext<'a> {
    handler: &'a Handler,
    args: PluginArgs,
}

impl<'a> PluginContext<'a> {
    pub fn new(handler: &'a Handler, args: PluginArgs) -> Self {
        Self { handler, args }
    }

    pub fn handler(&self) -> &'a Handler {
        self.handler
    }

    pub fn network(&self) -> &'a dyn Network {
        self.handler.network()
    }

    pub fn reinjection(&self) -> &'a Reinjection {
        self.handler.reinjection()
    }

    pub fn args(&self) -> &PluginArgs {
        &self.args
    }

    /// A filter argument as text.
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(|v| v.to_str().ok())
    }
}
