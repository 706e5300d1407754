//! Plugin lookup by name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProxyConfig;
use crate::net::tls::CertStore;
use crate::plugin::{Direct, Plugin, Strip};

/// Plugins known to the dispatcher.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `direct` and `strip` plugins.
    pub fn standard(config: &ProxyConfig) -> Self {
        let idle = match config.tunnel.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self::new().with(Direct::new(idle)).with(Strip::new(
            CertStore::new(&config.interception.cert_dir),
            config.interception.client_auth,
        ))
    }

    /// Add `plugin`, replacing any plugin registered under the same name.
    pub fn with(mut self, plugin: impl Plugin) -> Self {
        self.register(Arc::new(plugin));
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name().to_string();
        if self.plugins.insert(name.clone(), plugin).is_some() {
            tracing::warn!(plugin = %name, "Plugin registered twice; keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").field("plugins", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_has_builtin_plugins() {
        let registry = PluginRegistry::standard(&ProxyConfig::default());
        assert_eq!(registry.names(), vec!["direct", "strip"]);
        assert!(registry.get("direct").unwrap().handles_responses());
        assert!(!registry.get("strip").unwrap().handles_responses());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let registry = PluginRegistry::new().with(Direct::new(None)).with(Direct::new(Some(Duration::from_secs(1))));
        assert_eq!(registry.names(), vec!["direct"]);
    }
}
