//! Merges the wired discovery configuration with runtime configurations

use super::{ConfigLoader, DiscoveryConfig, PluginConfig, YamlConfigLoader};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Annotation opting a ConfigMap in as a runtime discovery source
pub const DISCOVERY_CONFIG_ANNOTATION: &str = "wavefront.com/discovery-config";

/// A ConfigMap (or similar object) that may carry discovery documents
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    /// Each entry is parsed independently as a discovery document
    pub data: BTreeMap<String, String>,
}

impl ConfigSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Mark this source as opted in to runtime discovery
    pub fn annotated(mut self) -> Self {
        self.annotations
            .insert(DISCOVERY_CONFIG_ANNOTATION.to_string(), "true".to_string());
        self
    }

    pub fn with_entry(mut self, key: impl Into<String>, document: impl Into<String>) -> Self {
        self.data.insert(key.into(), document.into());
        self
    }

    fn is_discovery_source(&self) -> bool {
        self.annotations
            .get(DISCOVERY_CONFIG_ANNOTATION)
            .is_some_and(|v| v == "true")
    }
}

struct ConfigState {
    /// Combined configuration handed out by `config()`
    combined: DiscoveryConfig,
    wired: DiscoveryConfig,
    /// Runtime rules keyed by source name, iterated in sorted order
    runtime: BTreeMap<String, Vec<PluginConfig>>,
    dirty: bool,
}

/// Tracks the wired configuration plus rules sourced from ConfigMaps
pub struct ConfigHandler {
    loader: Box<dyn ConfigLoader>,
    state: Mutex<ConfigState>,
    changes: Notify,
}

impl ConfigHandler {
    pub fn new(wired: DiscoveryConfig) -> Self {
        Self::with_loader(wired, Box::new(YamlConfigLoader))
    }

    pub fn with_loader(wired: DiscoveryConfig, loader: Box<dyn ConfigLoader>) -> Self {
        Self {
            loader,
            state: Mutex::new(ConfigState {
                combined: wired.clone(),
                wired,
                runtime: BTreeMap::new(),
                dirty: false,
            }),
            changes: Notify::new(),
        }
    }

    /// Get the combined configuration and whether it changed since the last call
    pub fn config(&self) -> (DiscoveryConfig, bool) {
        let mut state = self.lock();
        if !state.dirty {
            return (state.combined.clone(), false);
        }
        state.dirty = false;

        let combined = combine(&state.wired, &state.runtime);
        if combined != state.combined {
            state.combined = combined;
            return (state.combined.clone(), true);
        }
        (state.combined.clone(), false)
    }

    /// Replace the wired configuration, for example after the config file changed
    pub fn set_wired(&self, wired: DiscoveryConfig) {
        {
            let mut state = self.lock();
            state.wired = wired;
            state.dirty = true;
        }
        info!("wired discovery configuration updated");
        self.changes.notify_one();
    }

    /// Handle an added or updated source
    pub fn updated(&self, source: &ConfigSource) {
        if !source.is_discovery_source() {
            debug!(source = %source.name, "no runtime discovery annotation");
            self.deleted(&source.name);
            return;
        }

        let mut rules = Vec::new();
        for (key, document) in &source.data {
            match self.loader.load(document) {
                Ok(loaded) => rules.extend(loaded),
                Err(e) => {
                    error!(
                        source = %source.name,
                        entry = %key,
                        error = %e,
                        "error loading discovery config entry"
                    );
                }
            }
        }
        info!(source = %source.name, rules = rules.len(), "loaded discovery configuration");

        {
            let mut state = self.lock();
            state.runtime.insert(source.name.clone(), rules);
            state.dirty = true;
        }
        self.changes.notify_one();
    }

    /// Handle a deleted source
    pub fn deleted(&self, name: &str) {
        let removed = {
            let mut state = self.lock();
            let removed = state.runtime.remove(name).is_some();
            if removed {
                state.dirty = true;
            }
            removed
        };
        if removed {
            info!(source = %name, "deleted discovery configuration");
            self.changes.notify_one();
        }
    }

    /// Number of runtime sources currently contributing rules
    pub fn runtime_sources(&self) -> usize {
        self.lock().runtime.len()
    }

    /// Names of the runtime sources, sorted
    pub fn runtime_source_names(&self) -> Vec<String> {
        self.lock().runtime.keys().cloned().collect()
    }

    /// Resolves once a mutation has happened since the last wakeup
    pub async fn changed(&self) {
        self.changes.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConfigState> {
        // a poisoned lock only means a panic elsewhere, the state itself is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Wired rules followed by runtime rules in source name order
fn combine(wired: &DiscoveryConfig, runtime: &BTreeMap<String, Vec<PluginConfig>>) -> DiscoveryConfig {
    let mut combined = DiscoveryConfig {
        discovery_interval: wired.discovery_interval,
        annotation_prefix: wired.annotation_prefix.clone(),
        annotation_excludes: wired.annotation_excludes.clone(),
        enable_runtime_plugins: wired.enable_runtime_plugins,
        disable_annotation_discovery: wired.disable_annotation_discovery,
        plugin_configs: wired.plugin_configs.clone(),
        ..Default::default()
    };
    for rules in runtime.values() {
        combined.plugin_configs.extend(rules.iter().cloned());
    }
    debug!(total = combined.plugin_configs.len(), "combined discovery configurations");
    combined
}
