//! Registries tracking which handler owns each target name

use crate::encoder::ScrapeConfig;
use crate::handler::TargetHandler;
use crate::observability::DiscoveryMetrics;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// How often registry counts are published
pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Target name to owning handler, shared by the handlers of a plugin type
///
/// Handlers are held weakly: a handler owns its targets, the registry only
/// records which handler a name belongs to.
pub struct TargetRegistry {
    name: String,
    targets: DashMap<String, Weak<TargetHandler>>,
}

impl TargetRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            targets: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record `handler` as the owner of `target`
    pub fn register(&self, target: &str, handler: &Arc<TargetHandler>) {
        debug!(registry = %self.name, target = %target, "registering target");
        self.targets
            .insert(target.to_string(), Arc::downgrade(handler));
    }

    pub fn unregister(&self, target: &str) {
        debug!(registry = %self.name, target = %target, "unregistering target");
        self.targets.remove(target);
    }

    /// Owning handler of a target, if it is still alive
    pub fn handler(&self, target: &str) -> Option<Arc<TargetHandler>> {
        let owner = self.targets.get(target)?.value().upgrade();
        if owner.is_none() {
            // the owning pipeline is gone, forget the stale entry
            self.targets
                .remove_if(target, |_, handler| handler.strong_count() == 0);
        }
        owner
    }

    /// Current encoding of a target as held by its owner
    pub fn encoding(&self, target: &str) -> Option<ScrapeConfig> {
        self.handler(target)?.encoding(target)
    }

    pub fn count(&self) -> usize {
        self.targets.len()
    }

    /// Registered target names, sorted
    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Cache of target registries keyed by name
///
/// Asking for the same name twice returns the same registry, which is what
/// keeps target names unique across handlers of a plugin type.
pub struct Registries {
    registries: DashMap<String, Arc<TargetRegistry>>,
    metrics: DiscoveryMetrics,
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

impl Registries {
    pub fn new() -> Self {
        Self {
            registries: DashMap::new(),
            metrics: DiscoveryMetrics::new(),
        }
    }

    /// Get the registry for `name`, creating it on first use
    pub fn get_or_create(&self, name: &str) -> Arc<TargetRegistry> {
        self.registries
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(registry = %name, "creating target registry");
                Arc::new(TargetRegistry::new(name))
            })
            .value()
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<TargetRegistry>> {
        self.registries.get(name).map(|r| r.value().clone())
    }

    /// All registries sorted by name
    pub fn all(&self) -> Vec<Arc<TargetRegistry>> {
        let mut registries: Vec<_> = self.registries.iter().map(|r| r.value().clone()).collect();
        registries.sort_by(|a, b| a.name().cmp(b.name()));
        registries
    }

    /// Publish the target count of every registry
    pub fn report(&self) {
        for registry in self.all() {
            self.metrics
                .set_targets_registered(registry.name(), registry.count());
        }
    }

    /// Publish counts every `interval` until shutdown
    pub fn start_reporter(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let registries = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registries.report(),
                    _ = shutdown.recv() => {
                        debug!("registry reporter stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::TelegrafEncoder;
    use crate::handler::{HandlerOptions, ProviderInfo};
    use crate::providers::{ProviderCatalog, SourceFactory};

    fn handler(registry: &Arc<TargetRegistry>) -> Arc<TargetHandler> {
        TargetHandler::new(
            ProviderInfo {
                handler: Arc::new(ProviderCatalog::new()),
                factory: Arc::new(SourceFactory::Telegraf),
                encoder: Arc::new(TelegrafEncoder::redis()),
            },
            registry.clone(),
            HandlerOptions::default(),
        )
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = Arc::new(TargetRegistry::new("telegraf.redis"));
        let owner = handler(&registry);

        registry.register("pod/cache/redis-0", &owner);
        assert_eq!(registry.count(), 1);
        let found = registry.handler("pod/cache/redis-0").unwrap();
        assert!(Arc::ptr_eq(&found, &owner));

        registry.unregister("pod/cache/redis-0");
        assert_eq!(registry.count(), 0);
        assert!(registry.handler("pod/cache/redis-0").is_none());
    }

    #[test]
    fn test_register_replaces_owner() {
        let registry = Arc::new(TargetRegistry::new("telegraf.redis"));
        let first = handler(&registry);
        let second = handler(&registry);

        registry.register("pod/cache/redis-0", &first);
        registry.register("pod/cache/redis-0", &second);

        assert_eq!(registry.count(), 1);
        let owner = registry.handler("pod/cache/redis-0").unwrap();
        assert!(Arc::ptr_eq(&owner, &second));
    }

    #[test]
    fn test_dropped_handler_is_forgotten() {
        let registry = Arc::new(TargetRegistry::new("telegraf.redis"));
        let owner = handler(&registry);
        registry.register("pod/cache/redis-0", &owner);
        drop(owner);

        assert!(registry.handler("pod/cache/redis-0").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_registries_share_by_name() {
        let registries = Registries::new();
        let first = registries.get_or_create("prometheus");
        let second = registries.get_or_create("prometheus");
        let other = registries.get_or_create("telegraf.redis");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registries.all().len(), 2);
        assert!(registries.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let registries = Arc::new(Registries::new());
        registries.get_or_create("prometheus");

        let (tx, rx) = broadcast::channel(1);
        let task = registries.start_reporter(Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reporter stopped")
            .unwrap();
    }
}
