//! Per-pipeline target bookkeeping and provider lifecycle

use crate::config::PluginConfig;
use crate::encoder::{Encoder, ScrapeConfig};
use crate::observability::{DiscoveryMetrics, StructuredLogger};
use crate::providers::{provider_name, MetricsSourceProvider, ProviderFactory, ProviderHandler};
use crate::registry::TargetRegistry;
use crate::resource::Resource;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, error, info};

/// Decides whether an annotation-driven target may be dropped for a resource
pub type RegistrationPredicate = Arc<dyn Fn(&Resource) -> bool + Send + Sync>;

/// Provider plumbing for a handler
#[derive(Clone)]
pub struct ProviderInfo {
    pub handler: Arc<dyn ProviderHandler>,
    pub factory: Arc<dyn ProviderFactory>,
    pub encoder: Arc<dyn Encoder>,
}

#[derive(Clone, Default)]
pub struct HandlerOptions {
    /// Targets come from annotations rather than a rule
    pub use_annotations: bool,
    pub registration: Option<RegistrationPredicate>,
    pub logger: Option<StructuredLogger>,
}

/// Tracks the targets of one pipeline and keeps their providers in sync
pub struct TargetHandler {
    info: ProviderInfo,
    registry: Arc<TargetRegistry>,
    use_annotations: bool,
    registration: Option<RegistrationPredicate>,
    logger: StructuredLogger,
    metrics: DiscoveryMetrics,
    targets: RwLock<TargetSet>,
    this: Weak<TargetHandler>,
}

#[derive(Default)]
struct TargetSet {
    entries: BTreeMap<String, ScrapeConfig>,
    /// Set once the owning pipeline is torn down
    closed: bool,
}

impl TargetHandler {
    pub fn new(
        info: ProviderInfo,
        registry: Arc<TargetRegistry>,
        options: HandlerOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            info,
            registry,
            use_annotations: options.use_annotations,
            registration: options.registration,
            logger: options
                .logger
                .unwrap_or_else(|| StructuredLogger::new(String::new())),
            metrics: DiscoveryMetrics::new(),
            targets: RwLock::new(TargetSet::default()),
            this: this.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn use_annotations(&self) -> bool {
        self.use_annotations
    }

    /// Encode a resource and add, update or remove its target
    pub fn handle(&self, resource: &Resource, rule: Option<&PluginConfig>) {
        let name = resource.target_name();
        debug!(
            kind = %resource.kind,
            name = %resource.meta.name,
            namespace = %resource.meta.namespace,
            "handling resource"
        );

        if let Some(owner) = self.registry.handler(&name) {
            if !self.is(&owner) {
                debug!(target = %name, registry = %self.registry.name(), "target owned by another handler");
                return;
            }
        }

        let current = self.encoding(&name);
        let encoded = self
            .info
            .encoder
            .encode(&resource.ip, resource.kind, &resource.meta, rule);

        match encoded {
            Err(e) => {
                error!(target = %name, error = %e, "failed to encode target");
                self.metrics.inc_encoding_errors();
            }
            Ok(Some(encoding)) => {
                if current.as_ref() == Some(&encoding) {
                    return;
                }
                let provider = match self.info.factory.build(&encoding) {
                    Ok(provider) => provider,
                    Err(e) => {
                        error!(target = %name, error = %e, "failed to build provider");
                        self.metrics.inc_provider_build_errors();
                        return;
                    }
                };
                let action = if current.is_some() { "updated" } else { "added" };
                if self.register(&name, encoding, provider) {
                    self.logger
                        .log_target_change(action, &name, self.info.factory.name());
                }
            }
            Ok(None) => {
                let confirmed = self
                    .registration
                    .as_ref()
                    .is_some_and(|registered| registered(resource));
                if current.is_some() && self.use_annotations && confirmed {
                    info!(target = %name, "deleting target as annotation has changed");
                    self.unregister(&name);
                }
            }
        }
    }

    /// Remove a target if this handler holds it
    pub fn delete(&self, name: &str) {
        if self.contains(name) {
            self.unregister(name);
        }
    }

    /// Remove every target and refuse new ones
    pub fn close(&self) -> usize {
        self.write().closed = true;
        self.delete_missing(None)
    }

    /// Remove every target not in `keep`, or every target when `keep` is `None`
    pub fn delete_missing(&self, keep: Option<&HashSet<String>>) -> usize {
        let removed: Vec<String> = {
            let mut targets = self.write();
            let missing: Vec<String> = targets
                .entries
                .keys()
                .filter(|name| keep.map_or(true, |keep| !keep.contains(*name)))
                .cloned()
                .collect();
            for name in &missing {
                targets.entries.remove(name);
            }
            missing
        };
        for name in &removed {
            self.delete_provider(name);
        }
        removed.len()
    }

    pub fn count(&self) -> usize {
        self.read().entries.len()
    }

    /// Current encoding of a target held by this handler
    pub fn encoding(&self, name: &str) -> Option<ScrapeConfig> {
        self.read().entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().entries.contains_key(name)
    }

    /// Snapshot of all targets, sorted by name
    pub fn targets(&self) -> Vec<(String, ScrapeConfig)> {
        self.read()
            .entries
            .iter()
            .map(|(name, cfg)| (name.clone(), cfg.clone()))
            .collect()
    }

    /// Store and publish a target, `false` once the handler is closed
    fn register(
        &self,
        name: &str,
        encoding: ScrapeConfig,
        provider: Arc<dyn MetricsSourceProvider>,
    ) -> bool {
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        // held across publication so a concurrent close() sees the target
        let mut targets = self.write();
        if targets.closed {
            return false;
        }
        targets.entries.insert(name.to_string(), encoding);
        self.info.handler.add_provider(provider);
        self.registry.register(name, &this);
        true
    }

    fn unregister(&self, name: &str) {
        self.write().entries.remove(name);
        self.delete_provider(name);
        self.logger
            .log_target_change("deleted", name, self.info.factory.name());
    }

    /// Drop the provider and registry entry, only when this handler owns them
    fn delete_provider(&self, name: &str) {
        let owned = self
            .registry
            .handler(name)
            .is_some_and(|owner| self.is(&owner));
        if owned {
            self.info
                .handler
                .delete_provider(&provider_name(self.info.factory.name(), name));
            self.registry.unregister(name);
        }
        debug!(target = %name, "deleted");
    }

    fn is(&self, other: &Arc<TargetHandler>) -> bool {
        std::ptr::eq(Arc::as_ptr(other), self)
    }

    fn read(&self) -> RwLockReadGuard<'_, TargetSet> {
        self.targets.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TargetSet> {
        self.targets.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{PrometheusEncoder, TelegrafEncoder};
    use crate::providers::SourceFactory;
    use crate::resource::{Container, ObjectMeta};
    use crate::testing::RecordingProviders;

    fn redis_handler(
        registry: &Arc<TargetRegistry>,
        providers: &Arc<RecordingProviders>,
    ) -> Arc<TargetHandler> {
        TargetHandler::new(
            ProviderInfo {
                handler: providers.clone(),
                factory: Arc::new(SourceFactory::Telegraf),
                encoder: Arc::new(TelegrafEncoder::redis()),
            },
            registry.clone(),
            HandlerOptions::default(),
        )
    }

    fn redis_pod(ip: &str) -> Resource {
        Resource::pod(
            ip,
            ObjectMeta::new("redis-0", "cache"),
            vec![Container::new("redis:6.2", vec![6379])],
        )
    }

    fn redis_rule() -> PluginConfig {
        PluginConfig::new("redis", "telegraf/redis")
    }

    #[test]
    fn test_handle_adds_updates_and_deletes() {
        let registry = Arc::new(TargetRegistry::new("telegraf.redis"));
        let providers = Arc::new(RecordingProviders::default());
        let handler = redis_handler(&registry, &providers);

        handler.handle(&redis_pod("10.0.0.5"), Some(&redis_rule()));
        assert_eq!(handler.count(), 1);
        assert_eq!(registry.count(), 1);
        assert_eq!(providers.added().len(), 1);

        handler.handle(&redis_pod("10.0.0.6"), Some(&redis_rule()));
        assert_eq!(handler.count(), 1);
        assert_eq!(providers.added().len(), 2);
        assert_eq!(providers.live(), vec!["telegraf_metrics_source: pod/cache/redis-0"]);

        handler.delete("pod/cache/redis-0");
        assert_eq!(handler.count(), 0);
        assert_eq!(registry.count(), 0);
        assert_eq!(providers.deleted(), vec!["telegraf_metrics_source: pod/cache/redis-0"]);
        assert!(providers.live().is_empty());
    }

    #[test]
    fn test_handle_is_idempotent() {
        let registry = Arc::new(TargetRegistry::new("telegraf.redis"));
        let providers = Arc::new(RecordingProviders::default());
        let handler = redis_handler(&registry, &providers);

        for _ in 0..3 {
            handler.handle(&redis_pod("10.0.0.5"), Some(&redis_rule()));
        }
        assert_eq!(providers.added().len(), 1);
        assert_eq!(handler.count(), 1);
    }

    #[test]
    fn test_target_owned_by_other_handler_is_skipped() {
        let registry = Arc::new(TargetRegistry::new("telegraf.redis"));
        let providers = Arc::new(RecordingProviders::default());
        let first = redis_handler(&registry, &providers);
        let second = redis_handler(&registry, &providers);

        first.handle(&redis_pod("10.0.0.5"), Some(&redis_rule()));
        second.handle(&redis_pod("10.0.0.5"), Some(&redis_rule()));

        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 0);
        assert_eq!(registry.count(), 1);

        // deleting through a handler that does not hold the target is a no-op
        second.delete("pod/cache/redis-0");
        assert_eq!(registry.count(), 1);
        assert!(providers.deleted().is_empty());
    }

    #[test]
    fn test_delete_missing() {
        let registry = Arc::new(TargetRegistry::new("telegraf.redis"));
        let providers = Arc::new(RecordingProviders::default());
        let handler = redis_handler(&registry, &providers);

        let mut other = redis_pod("10.0.0.9");
        other.meta.name = "redis-1".to_string();
        handler.handle(&redis_pod("10.0.0.5"), Some(&redis_rule()));
        handler.handle(&other, Some(&redis_rule()));
        assert_eq!(handler.count(), 2);

        let keep: HashSet<String> = ["pod/cache/redis-1".to_string()].into_iter().collect();
        assert_eq!(handler.delete_missing(Some(&keep)), 1);
        assert!(handler.contains("pod/cache/redis-1"));

        assert_eq!(handler.delete_missing(None), 1);
        assert_eq!(handler.count(), 0);
        assert_eq!(registry.count(), 0);
        assert!(providers.live().is_empty());
    }

    #[test]
    fn test_closed_handler_refuses_targets() {
        let registry = Arc::new(TargetRegistry::new("telegraf.redis"));
        let providers = Arc::new(RecordingProviders::default());
        let handler = redis_handler(&registry, &providers);

        handler.handle(&redis_pod("10.0.0.5"), Some(&redis_rule()));
        assert_eq!(handler.close(), 1);

        handler.handle(&redis_pod("10.0.0.6"), Some(&redis_rule()));
        assert_eq!(handler.count(), 0);
        assert_eq!(registry.count(), 0);
        assert!(providers.live().is_empty());
    }

    #[test]
    fn test_build_failure_leaves_no_target() {
        let registry = Arc::new(TargetRegistry::new("telegraf.redis"));
        let providers = Arc::new(RecordingProviders::default());
        let handler = TargetHandler::new(
            ProviderInfo {
                handler: providers.clone(),
                factory: Arc::new(SourceFactory::Prometheus),
                encoder: Arc::new(TelegrafEncoder::redis()),
            },
            registry.clone(),
            HandlerOptions::default(),
        );

        handler.handle(&redis_pod("10.0.0.5"), Some(&redis_rule()));
        assert_eq!(handler.count(), 0);
        assert_eq!(registry.count(), 0);
        assert!(providers.added().is_empty());
    }

    #[test]
    fn test_annotation_target_removed_when_scrape_turned_off() {
        let registry = Arc::new(TargetRegistry::new("prometheus"));
        let providers = Arc::new(RecordingProviders::default());
        let handler = TargetHandler::new(
            ProviderInfo {
                handler: providers.clone(),
                factory: Arc::new(SourceFactory::Prometheus),
                encoder: Arc::new(PrometheusEncoder::new("prometheus.io", "node-1")),
            },
            registry.clone(),
            HandlerOptions {
                use_annotations: true,
                registration: Some(Arc::new(|_: &Resource| true)),
                logger: None,
            },
        );

        let mut pod = Resource::pod(
            "10.0.0.7",
            ObjectMeta::new("web-1", "prod").with_annotation("prometheus.io/scrape", "true"),
            vec![],
        );
        handler.handle(&pod, None);
        assert_eq!(handler.count(), 1);

        pod.meta
            .annotations
            .insert("prometheus.io/scrape".to_string(), "false".to_string());
        handler.handle(&pod, None);
        assert_eq!(handler.count(), 0);
        assert_eq!(registry.count(), 0);
        assert!(providers.live().is_empty());
    }

    #[test]
    fn test_encoding_error_is_counted_and_adds_nothing() {
        let registry = Arc::new(TargetRegistry::new("prometheus"));
        let providers = Arc::new(RecordingProviders::default());
        let handler = TargetHandler::new(
            ProviderInfo {
                handler: providers.clone(),
                factory: Arc::new(SourceFactory::Prometheus),
                encoder: Arc::new(PrometheusEncoder::new("prometheus.io", "node-1")),
            },
            registry,
            HandlerOptions::default(),
        );
        let metrics = DiscoveryMetrics::new();
        let before = metrics.encoding_errors();

        let pod = Resource::pod(
            "10.0.0.7",
            ObjectMeta::new("web-1", "prod")
                .with_annotation("prometheus.io/scrape", "true")
                .with_annotation("prometheus.io/timeout", "soon"),
            vec![],
        );
        handler.handle(&pod, None);

        assert!(metrics.encoding_errors() > before);
        assert_eq!(handler.count(), 0);
        assert!(providers.added().is_empty());
    }

    #[test]
    fn test_concurrent_updates_converge_on_last_write() {
        let registry = Arc::new(TargetRegistry::new("telegraf.redis"));
        let providers = Arc::new(RecordingProviders::default());
        let handler = redis_handler(&registry, &providers);
        let rule = redis_rule();

        std::thread::scope(|scope| {
            for i in 0..8 {
                let handler = &handler;
                let rule = &rule;
                scope.spawn(move || {
                    for round in 0..25 {
                        handler.handle(&redis_pod(&format!("10.0.{i}.{round}")), Some(rule));
                    }
                });
            }
        });

        let name = "pod/cache/redis-0";
        let provider_name = "telegraf_metrics_source: pod/cache/redis-0";
        assert_eq!(providers.live(), vec![provider_name]);
        assert_eq!(handler.count(), 1);
        assert_eq!(registry.count(), 1);
        let provider = providers.provider(provider_name).unwrap();
        assert_eq!(Some(provider.config().clone()), handler.encoding(name));
        assert_eq!(registry.encoding(name), handler.encoding(name));
    }

    #[test]
    fn test_annotation_target_kept_without_confirmation() {
        let registry = Arc::new(TargetRegistry::new("prometheus"));
        let providers = Arc::new(RecordingProviders::default());
        let handler = TargetHandler::new(
            ProviderInfo {
                handler: providers.clone(),
                factory: Arc::new(SourceFactory::Prometheus),
                encoder: Arc::new(PrometheusEncoder::new("prometheus.io", "node-1")),
            },
            registry,
            HandlerOptions {
                use_annotations: true,
                registration: Some(Arc::new(|_: &Resource| false)),
                logger: None,
            },
        );

        let mut pod = Resource::pod(
            "10.0.0.7",
            ObjectMeta::new("web-1", "prod").with_annotation("prometheus.io/scrape", "true"),
            vec![],
        );
        handler.handle(&pod, None);
        pod.meta.annotations.clear();
        handler.handle(&pod, None);
        assert_eq!(handler.count(), 1);
    }
}
