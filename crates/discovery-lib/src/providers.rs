//! Metric source providers built from discovered targets
//!
//! The engine does not scrape anything itself. It hands each encoded target
//! to a [`ProviderFactory`] and passes the result to a [`ProviderHandler`],
//! which owns the live providers.

use crate::encoder::ScrapeConfig;
use crate::error::{DiscoveryError, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A live source of metrics for one target
pub trait MetricsSourceProvider: Send + Sync + fmt::Debug {
    /// Unique provider name, `<factory>: <target>`
    fn name(&self) -> &str;
    fn config(&self) -> &ScrapeConfig;
}

/// Builds providers from scrape configurations
pub trait ProviderFactory: Send + Sync {
    fn name(&self) -> &str;
    fn build(&self, config: &ScrapeConfig) -> Result<Arc<dyn MetricsSourceProvider>>;
}

/// Receives providers as targets come and go
pub trait ProviderHandler: Send + Sync {
    /// Add a provider, replacing any provider with the same name
    fn add_provider(&self, provider: Arc<dyn MetricsSourceProvider>);
    fn delete_provider(&self, name: &str);
}

/// Name under which a factory registers the provider for a target
pub fn provider_name(factory: &str, target: &str) -> String {
    format!("{factory}: {target}")
}

/// Provider holding the scrape configuration of a target
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeSourceProvider {
    name: String,
    config: ScrapeConfig,
}

impl MetricsSourceProvider for ScrapeSourceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ScrapeConfig {
        &self.config
    }
}

/// Factory for one provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFactory {
    Prometheus,
    Telegraf,
}

impl SourceFactory {
    /// Factory serving a provider family
    pub fn for_family(family: &str) -> Result<Self> {
        match family {
            "prometheus" => Ok(SourceFactory::Prometheus),
            "telegraf" => Ok(SourceFactory::Telegraf),
            other => Err(DiscoveryError::UnknownPluginType(other.to_string())),
        }
    }
}

impl ProviderFactory for SourceFactory {
    fn name(&self) -> &str {
        match self {
            SourceFactory::Prometheus => "prometheus_metrics_source",
            SourceFactory::Telegraf => "telegraf_metrics_source",
        }
    }

    fn build(&self, config: &ScrapeConfig) -> Result<Arc<dyn MetricsSourceProvider>> {
        match (self, config) {
            (SourceFactory::Prometheus, ScrapeConfig::Prometheus(cfg)) if cfg.url.is_empty() => {
                Err(DiscoveryError::Provider {
                    name: cfg.name.clone(),
                    reason: "missing prometheus url".to_string(),
                })
            }
            (SourceFactory::Telegraf, ScrapeConfig::Telegraf(cfg)) if cfg.plugins.is_empty() => {
                Err(DiscoveryError::Provider {
                    name: cfg.name.clone(),
                    reason: "missing telegraf plugin".to_string(),
                })
            }
            (SourceFactory::Prometheus, ScrapeConfig::Prometheus(_))
            | (SourceFactory::Telegraf, ScrapeConfig::Telegraf(_)) => {
                Ok(Arc::new(ScrapeSourceProvider {
                    name: provider_name(self.name(), config.name()),
                    config: config.clone(),
                }))
            }
            _ => Err(DiscoveryError::Provider {
                name: config.name().to_string(),
                reason: format!("{} cannot build this configuration", self.name()),
            }),
        }
    }
}

/// In-memory set of live providers, keyed by provider name
#[derive(Default)]
pub struct ProviderCatalog {
    providers: DashMap<String, Arc<dyn MetricsSourceProvider>>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MetricsSourceProvider>> {
        self.providers.get(name).map(|p| p.value().clone())
    }

    /// All providers sorted by name
    pub fn list(&self) -> Vec<Arc<dyn MetricsSourceProvider>> {
        let mut providers: Vec<_> = self.providers.iter().map(|p| p.value().clone()).collect();
        providers.sort_by(|a, b| a.name().cmp(b.name()));
        providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl ProviderHandler for ProviderCatalog {
    fn add_provider(&self, provider: Arc<dyn MetricsSourceProvider>) {
        debug!(provider = %provider.name(), "adding provider");
        self.providers.insert(provider.name().to_string(), provider);
    }

    fn delete_provider(&self, name: &str) {
        debug!(provider = %name, "deleting provider");
        self.providers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::encoder::{Encoder, PrometheusEncoder, TelegrafEncoder};
    use crate::resource::{ObjectMeta, ResourceKind};

    fn prometheus_config() -> ScrapeConfig {
        let meta = ObjectMeta::new("web-1", "prod").with_annotation("prometheus.io/scrape", "true");
        PrometheusEncoder::new("prometheus.io", "node-1")
            .encode("10.0.0.7", ResourceKind::Pod, &meta, None)
            .unwrap()
            .unwrap()
    }

    fn telegraf_config() -> ScrapeConfig {
        TelegrafEncoder::redis()
            .encode(
                "10.0.0.5",
                ResourceKind::Pod,
                &ObjectMeta::new("redis-0", "cache"),
                Some(&PluginConfig::new("redis", "telegraf/redis")),
            )
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_factory_builds_named_provider() {
        let provider = SourceFactory::Prometheus.build(&prometheus_config()).unwrap();
        assert_eq!(provider.name(), "prometheus_metrics_source: pod/prod/web-1");
        assert_eq!(provider.config(), &prometheus_config());

        let provider = SourceFactory::Telegraf.build(&telegraf_config()).unwrap();
        assert_eq!(provider.name(), "telegraf_metrics_source: pod/cache/redis-0");
    }

    #[test]
    fn test_factory_rejects_other_family() {
        let result = SourceFactory::Telegraf.build(&prometheus_config());
        assert!(matches!(result, Err(DiscoveryError::Provider { .. })));
    }

    #[test]
    fn test_factory_for_family() {
        assert_eq!(SourceFactory::for_family("prometheus").unwrap(), SourceFactory::Prometheus);
        assert_eq!(SourceFactory::for_family("telegraf").unwrap(), SourceFactory::Telegraf);
        assert!(SourceFactory::for_family("statsd").is_err());
    }

    #[test]
    fn test_catalog_add_replace_delete() {
        let catalog = ProviderCatalog::new();
        let provider = SourceFactory::Prometheus.build(&prometheus_config()).unwrap();

        catalog.add_provider(provider.clone());
        catalog.add_provider(provider.clone());
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get(provider.name()).is_some());

        catalog.delete_provider(provider.name());
        assert!(catalog.is_empty());

        // deleting an unknown provider is a no-op
        catalog.delete_provider("missing");
        assert!(catalog.is_empty());
    }
}
