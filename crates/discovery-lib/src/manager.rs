//! Discovery lifecycle: resource watchers, leadership and config resync
//!
//! Pods are always watched. Services are cluster scoped, so in daemon mode
//! they are only watched while this agent leads. Every resource seen is kept
//! in a cache so it can be replayed through the discoverer when rules change.

use crate::config::ConfigHandler;
use crate::discoverer::Discoverer;
use crate::leadership::{Leadership, LeadershipGate};
use crate::observability::DiscoveryMetrics;
use crate::resource::{Resource, ResourceKind};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Name the manager subscribes to leadership with
pub const SUBSCRIBER_NAME: &str = "discovery.manager";

const EVENT_BUFFER: usize = 256;

/// Change to a watched resource
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Applied(Resource),
    Deleted(Resource),
    /// Complete listing after a (re)connect, anything missing is gone
    Restarted(Vec<Resource>),
}

/// Source of resource events for one kind
#[async_trait]
pub trait ResourceWatcher: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Send events until shutdown or until the watch fails
    async fn watch(
        &self,
        events: mpsc::Sender<ResourceEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Discover cluster scoped resources (services and the API server)
    pub scrape_cluster: bool,
    /// Fallback resync period, also triggered by config changes
    pub discovery_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            scrape_cluster: true,
            discovery_interval: crate::config::DEFAULT_DISCOVERY_INTERVAL,
        }
    }
}

struct WatchTask {
    stop: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    shutdown: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    services: Option<WatchTask>,
}

/// Runs discovery: feeds watcher events and rule changes into the [`Discoverer`]
pub struct DiscoveryManager {
    discoverer: Arc<Discoverer>,
    config: Arc<ConfigHandler>,
    leadership: Arc<Leadership>,
    pods: Arc<dyn ResourceWatcher>,
    services: Arc<dyn ResourceWatcher>,
    options: ManagerOptions,
    cache: Arc<DashMap<String, Resource>>,
    state: Mutex<ManagerState>,
    metrics: DiscoveryMetrics,
}

impl DiscoveryManager {
    pub fn new(
        discoverer: Arc<Discoverer>,
        config: Arc<ConfigHandler>,
        leadership: Arc<Leadership>,
        pods: Arc<dyn ResourceWatcher>,
        services: Arc<dyn ResourceWatcher>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            discoverer,
            config,
            leadership,
            pods,
            services,
            options,
            cache: Arc::new(DashMap::new()),
            state: Mutex::new(ManagerState::default()),
            metrics: DiscoveryMetrics::new(),
        })
    }

    pub fn discoverer(&self) -> &Arc<Discoverer> {
        &self.discoverer
    }

    pub fn running(&self) -> bool {
        self.lock().shutdown.is_some()
    }

    /// Whether the service watcher is currently running
    pub fn watching_services(&self) -> bool {
        self.lock().services.is_some()
    }

    /// Number of resources currently known to the watchers
    pub fn cached_resources(&self) -> usize {
        self.cache.len()
    }

    /// Install the current rules and start the watchers
    pub fn start(self: &Arc<Self>) {
        let shutdown = {
            let mut state = self.lock();
            if state.shutdown.is_some() {
                debug!("discovery manager already running");
                return;
            }
            let (tx, _) = broadcast::channel(1);
            state.shutdown = Some(tx.clone());
            tx
        };
        info!(
            daemon = self.leadership.daemon(),
            scrape_cluster = self.options.scrape_cluster,
            "starting discovery manager"
        );
        self.metrics.set_discovery_enabled(true);

        let (cfg, _) = self.config.config();
        self.discoverer
            .set_annotation_policy(&cfg.annotation_excludes, cfg.disable_annotation_discovery);
        self.discoverer.handle_all(&cfg.plugin_configs);

        let mut tasks = vec![
            self.spawn_watch(self.pods.clone(), shutdown.subscribe()),
            self.spawn_resync(shutdown.subscribe()),
        ];

        if self.options.scrape_cluster {
            if self.leadership.daemon() {
                tasks.push(self.spawn_leadership(shutdown.subscribe()));
            } else {
                self.resume();
            }
        }
        self.lock().tasks.extend(tasks);
    }

    /// Stop every task and tear down all targets
    pub async fn stop(&self) {
        let (shutdown, tasks, services) = {
            let mut state = self.lock();
            let Some(shutdown) = state.shutdown.take() else {
                return;
            };
            (
                shutdown,
                std::mem::take(&mut state.tasks),
                state.services.take(),
            )
        };
        info!("stopping discovery manager");

        self.leadership.unsubscribe(SUBSCRIBER_NAME);
        let _ = shutdown.send(());
        if let Some(services) = services {
            let _ = services.stop.send(());
            await_task(services.task).await;
        }
        for task in tasks {
            await_task(task).await;
        }

        self.discoverer.delete_all();
        self.cache.clear();
        self.metrics.set_discovery_enabled(false);
    }

    /// Start cluster scoped discovery
    pub fn resume(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.shutdown.is_none() || state.services.is_some() {
                return;
            }
            let (stop, rx) = broadcast::channel(1);
            let task = self.spawn_watch(self.services.clone(), rx);
            state.services = Some(WatchTask { stop, task });
        }
        info!(leader = %self.leadership.leader(), "starting service discovery");
        self.discoverer.refresh_api_server();
    }

    /// Stop cluster scoped discovery and drop its targets and cached resources
    pub fn pause(&self) {
        let Some(services) = self.lock().services.take() else {
            return;
        };
        info!(leader = %self.leadership.leader(), "stopping service discovery");
        let _ = services.stop.send(());

        let purged: Vec<Resource> = self
            .cache
            .iter()
            .filter(|r| r.value().kind.is_cluster_scoped())
            .map(|r| r.value().clone())
            .collect();
        for resource in &purged {
            self.cache.remove(&resource.target_name());
        }
        self.discoverer.delete_cluster_scoped(&purged);
        debug!(purged = purged.len(), "dropped cluster scoped targets");
    }

    /// Apply the combined config if it changed, then replay known resources
    pub fn resync(&self) -> bool {
        let (cfg, changed) = self.config.config();
        if !changed {
            return false;
        }
        info!(rules = cfg.plugin_configs.len(), "discovery configuration changed");
        self.metrics.inc_config_reloads();
        self.discoverer
            .set_annotation_policy(&cfg.annotation_excludes, cfg.disable_annotation_discovery);
        self.discoverer.handle_all(&cfg.plugin_configs);

        let leading = self.leadership.leading();
        let resources: Vec<Resource> = self
            .cache
            .iter()
            .filter(|r| leading || !r.value().kind.is_cluster_scoped())
            .map(|r| r.value().clone())
            .collect();
        for resource in &resources {
            self.discoverer.discover(resource);
        }
        true
    }

    fn spawn_watch(
        &self,
        watcher: Arc<dyn ResourceWatcher>,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let discoverer = self.discoverer.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let kind = watcher.kind();
            info!(kind = %kind, "starting resource watcher");

            let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
            let producer = watcher.watch(tx, shutdown);
            tokio::pin!(producer);
            let mut producing = true;

            loop {
                tokio::select! {
                    result = &mut producer, if producing => {
                        producing = false;
                        match result {
                            Ok(()) => debug!(kind = %kind, "resource watcher stopped"),
                            Err(e) => error!(kind = %kind, error = %e, "resource watcher failed"),
                        }
                    }
                    event = rx.recv() => match event {
                        Some(event) => apply(&discoverer, &cache, kind, event),
                        None => break,
                    },
                }
            }
        })
    }

    fn spawn_resync(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.options.discovery_interval;
        tokio::spawn(async move {
            info!(interval = %humantime::format_duration(period), "starting config resync");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.config.changed() => {}
                    _ = ticker.tick() => debug!("checking for discovery config changes"),
                    _ = shutdown.recv() => break,
                }
                manager.resync();
            }
            debug!("config resync stopped");
        })
    }

    fn spawn_leadership(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut leading = self.leadership.subscribe(SUBSCRIBER_NAME);
        tokio::spawn(async move {
            if *leading.borrow_and_update() {
                manager.resume();
            }
            loop {
                tokio::select! {
                    changed = leading.changed() => {
                        if changed.is_err() {
                            warn!("leadership channel closed");
                            break;
                        }
                        if *leading.borrow_and_update() {
                            manager.resume();
                        } else {
                            manager.pause();
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn apply(
    discoverer: &Discoverer,
    cache: &DashMap<String, Resource>,
    kind: ResourceKind,
    event: ResourceEvent,
) {
    match event {
        ResourceEvent::Applied(resource) => {
            cache.insert(resource.target_name(), resource.clone());
            discoverer.discover(&resource);
        }
        ResourceEvent::Deleted(resource) => {
            cache.remove(&resource.target_name());
            discoverer.delete_resource(&resource);
        }
        ResourceEvent::Restarted(resources) => {
            let current: HashSet<String> = resources.iter().map(Resource::target_name).collect();
            let gone: Vec<Resource> = cache
                .iter()
                .filter(|r| r.value().kind == kind && !current.contains(r.key()))
                .map(|r| r.value().clone())
                .collect();
            for resource in gone {
                cache.remove(&resource.target_name());
                discoverer.delete_resource(&resource);
            }
            for resource in resources {
                cache.insert(resource.target_name(), resource.clone());
                discoverer.discover(&resource);
            }
        }
    }
}

async fn await_task(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        if !e.is_cancelled() {
            error!(error = %e, "discovery task panicked");
        }
    }
}
