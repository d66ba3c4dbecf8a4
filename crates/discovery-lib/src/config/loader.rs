//! Loading discovery documents from YAML

use super::{DiscoveryConfig, PluginConfig};
use crate::error::Result;
use std::path::Path;
use tracing::warn;

/// Parses a discovery document into rules
///
/// Malformed documents are an error and nothing from them is applied.
pub trait ConfigLoader: Send + Sync {
    fn load(&self, document: &str) -> Result<Vec<PluginConfig>>;
}

/// Strict YAML loader: unknown fields are rejected
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlConfigLoader;

impl ConfigLoader for YamlConfigLoader {
    fn load(&self, document: &str) -> Result<Vec<PluginConfig>> {
        Ok(DiscoveryConfig::from_yaml(document)?.plugin_configs)
    }
}

impl DiscoveryConfig {
    /// Load the configuration from a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let mut cfg: DiscoveryConfig = if contents.trim().is_empty() {
            DiscoveryConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        cfg.convert_prom_configs();
        Ok(cfg)
    }

    /// Load the configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Moves deprecated prometheus configs into the plugin rule list
    fn convert_prom_configs(&mut self) {
        if self.prom_configs.is_empty() {
            return;
        }
        warn!(
            count = self.prom_configs.len(),
            "prom_configs is deprecated, use plugins instead"
        );
        let converted = std::mem::take(&mut self.prom_configs)
            .into_iter()
            .map(PluginConfig::from);
        self.plugin_configs.extend(converted);
    }
}
