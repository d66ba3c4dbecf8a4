//! Rule pipelines and the routing of resource events to them
//!
//! Each installed rule becomes a pipeline: a compiled [`ResourceFilter`],
//! the rule itself and the [`TargetHandler`] holding its targets. Resources
//! that no rule claims fall through to annotation based discovery.

use crate::config::{DiscoveryConfig, PluginConfig, Selectors};
use crate::encoder::{self, registry_name, EncoderRegistry, ScrapeConfig};
use crate::error::Result;
use crate::filter::ResourceFilter;
use crate::handler::{HandlerOptions, ProviderInfo, TargetHandler};
use crate::leadership::LeadershipGate;
use crate::observability::{DiscoveryMetrics, StructuredLogger};
use crate::providers::{ProviderHandler, SourceFactory};
use crate::registry::Registries;
use crate::resource::{Resource, ResourceKind};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

/// Name used for targets discovered through annotations
pub const ANNOTATION_PIPELINE: &str = "annotation";

/// Default port for API server rules
const API_SERVER_PORT: &str = "443";

/// Default scheme for API server rules
const API_SERVER_SCHEME: &str = "https";

struct Pipeline {
    filter: ResourceFilter,
    rule: PluginConfig,
    handler: Arc<TargetHandler>,
}

/// Which resources may be discovered through annotations
#[derive(Default)]
struct AnnotationPolicy {
    disabled: bool,
    excludes: Vec<ResourceFilter>,
}

impl AnnotationPolicy {
    fn compile(excludes: &[Selectors], disabled: bool) -> Self {
        let excludes = excludes
            .iter()
            .enumerate()
            .filter_map(|(i, selectors)| {
                let rule = PluginConfig {
                    selectors: selectors.clone(),
                    ..PluginConfig::new(format!("annotation-exclude-{i}"), "prometheus")
                };
                ResourceFilter::new(&rule)
                    .map_err(|e| error!(index = i, error = %e, "invalid annotation exclude"))
                    .ok()
            })
            .collect();
        Self { disabled, excludes }
    }

    fn excluded(&self, resource: &Resource) -> bool {
        self.excludes.iter().any(|f| f.matches(resource))
    }

    fn allows(&self, resource: &Resource) -> bool {
        !self.disabled && !self.excluded(resource)
    }
}

/// Summary of an installed rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSummary {
    pub name: String,
    pub plugin_type: String,
    pub resource_type: ResourceKind,
    pub targets: usize,
}

/// A discovered target and the pipeline holding it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSummary {
    pub name: String,
    pub rule: String,
    pub plugin_type: String,
    pub config: ScrapeConfig,
}

/// Owns the rule pipelines and routes resources through them
pub struct Discoverer {
    pipelines: Mutex<BTreeMap<String, Pipeline>>,
    annotations: Arc<TargetHandler>,
    policy: Arc<RwLock<AnnotationPolicy>>,
    encoders: EncoderRegistry,
    registries: Arc<Registries>,
    providers: Arc<dyn ProviderHandler>,
    leadership: Arc<dyn LeadershipGate>,
    logger: StructuredLogger,
    metrics: DiscoveryMetrics,
}

impl Discoverer {
    pub fn new(
        cfg: &DiscoveryConfig,
        node_name: &str,
        registries: Arc<Registries>,
        providers: Arc<dyn ProviderHandler>,
        leadership: Arc<dyn LeadershipGate>,
        logger: StructuredLogger,
    ) -> Self {
        let encoders = EncoderRegistry::new(cfg.annotation_prefix(), node_name);
        let policy = Arc::new(RwLock::new(AnnotationPolicy::compile(
            &cfg.annotation_excludes,
            cfg.disable_annotation_discovery,
        )));

        // annotation based discovery is supported for prometheus only
        let registration_policy = Arc::clone(&policy);
        let annotations = TargetHandler::new(
            ProviderInfo {
                handler: providers.clone(),
                factory: Arc::new(SourceFactory::Prometheus),
                encoder: Arc::new(encoder::PrometheusEncoder::new(
                    cfg.annotation_prefix(),
                    node_name,
                )),
            },
            registries.get_or_create("prometheus"),
            HandlerOptions {
                use_annotations: true,
                registration: Some(Arc::new(move |resource: &Resource| {
                    registration_policy
                        .read()
                        .map(|policy| !policy.excluded(resource))
                        .unwrap_or(true)
                })),
                logger: Some(logger.clone()),
            },
        );

        Self {
            pipelines: Mutex::new(BTreeMap::new()),
            annotations,
            policy,
            encoders,
            registries,
            providers,
            leadership,
            logger,
            metrics: DiscoveryMetrics::new(),
        }
    }

    /// Reconcile the installed pipelines with a complete rule set
    ///
    /// Pipelines whose rule name is missing are torn down first, then every
    /// rule is installed or hot-swapped. Invalid rules are logged and skipped
    /// without affecting the others. Returns the number of rules that failed.
    pub fn handle_all(&self, rules: &[PluginConfig]) -> usize {
        let mut api_servers = Vec::new();
        let (installed, removed, failed) = {
            let mut pipelines = self.lock();

            let names: HashSet<&str> = rules.iter().map(|r| r.name.as_str()).collect();
            let missing: Vec<String> = pipelines
                .keys()
                .filter(|name| !names.contains(name.as_str()))
                .cloned()
                .collect();
            for name in &missing {
                info!(rule = %name, "deleting discovery rule");
                Self::teardown(&mut pipelines, name);
            }

            let mut installed = 0;
            let mut failed = 0;
            for rule in rules {
                match self.install(&mut pipelines, rule) {
                    Ok(api_server) => {
                        installed += 1;
                        api_servers.extend(api_server);
                    }
                    Err(e) => {
                        failed += 1;
                        error!(rule = %rule.name, plugin_type = %rule.plugin_type, error = %e, "error processing rule");
                    }
                }
            }
            self.metrics.set_rules_count(pipelines.len());
            (installed, missing.len(), failed)
        };

        for (handler, rule) in api_servers {
            self.discover_api_server(&handler, &rule);
        }
        self.logger.log_reconcile(installed, removed, failed);
        failed
    }

    /// Install or hot-swap a single rule
    pub fn handle(&self, rule: &PluginConfig) -> Result<()> {
        info!(rule = %rule.name, plugin_type = %rule.plugin_type, "handling rule");
        let api_server = {
            let mut pipelines = self.lock();
            let api_server = self.install(&mut pipelines, rule)?;
            self.metrics.set_rules_count(pipelines.len());
            api_server
        };
        if let Some((handler, rule)) = api_server {
            self.discover_api_server(&handler, &rule);
        }
        Ok(())
    }

    /// Tear down the pipeline of a rule and all of its targets
    pub fn delete(&self, name: &str) {
        let mut pipelines = self.lock();
        if Self::teardown(&mut pipelines, name) {
            info!(rule = %name, "deleted discovery rule");
        }
        self.metrics.set_rules_count(pipelines.len());
    }

    /// Route an added or updated resource to the pipelines that claim it
    pub fn discover(&self, resource: &Resource) {
        let name = resource.target_name();
        if resource.kind.is_cluster_scoped() && !self.leadership.leading() {
            debug!(target = %name, "not the leader, skipping cluster scoped resource");
            return;
        }
        let (matched, stale) = {
            let pipelines = self.lock();
            let mut matched = Vec::new();
            let mut stale = Vec::new();
            for pipeline in pipelines.values() {
                if pipeline.filter.matches(resource) {
                    matched.push((pipeline.handler.clone(), pipeline.rule.clone()));
                } else if pipeline.handler.contains(&name) {
                    stale.push(pipeline.handler.clone());
                }
            }
            (matched, stale)
        };

        // the resource no longer matches these rules
        for handler in stale {
            debug!(target = %name, "dropping target no longer matching its rule");
            handler.delete(&name);
        }

        if matched.is_empty() {
            self.discover_by_annotation(resource, &name);
            return;
        }

        // rules take precedence over annotations
        self.annotations.delete(&name);
        for (handler, rule) in matched {
            handler.handle(resource, Some(&rule));
        }
    }

    /// Remove every target derived from a deleted resource
    pub fn delete_resource(&self, resource: &Resource) {
        let name = resource.target_name();
        let handlers: Vec<Arc<TargetHandler>> = self
            .lock()
            .values()
            .map(|p| p.handler.clone())
            .collect();
        for handler in handlers {
            handler.delete(&name);
        }
        self.annotations.delete(&name);
    }

    /// Drop the targets of cluster scoped resources, including the API server
    pub fn delete_cluster_scoped(&self, resources: &[Resource]) {
        for resource in resources {
            self.delete_resource(resource);
        }
        self.delete_resource(&Resource::api_server());
    }

    /// Tear down every pipeline and annotation target
    pub fn delete_all(&self) {
        self.handle_all(&[]);
        self.annotations.delete_missing(None);
    }

    /// Update annotation discovery settings, dropping annotation targets when disabled
    pub fn set_annotation_policy(&self, excludes: &[Selectors], disabled: bool) {
        let policy = AnnotationPolicy::compile(excludes, disabled);
        match self.policy.write() {
            Ok(mut current) => *current = policy,
            Err(e) => *e.into_inner() = policy,
        }
        if disabled {
            let removed = self.annotations.delete_missing(None);
            if removed > 0 {
                info!(removed, "annotation discovery disabled, removed annotation targets");
            }
        }
    }

    /// Re-run API server rules, for example after gaining leadership
    pub fn refresh_api_server(&self) {
        let api_servers: Vec<_> = self
            .lock()
            .values()
            .filter(|p| p.filter.kind() == ResourceKind::ApiServer)
            .map(|p| (p.handler.clone(), p.rule.clone()))
            .collect();
        for (handler, rule) in api_servers {
            self.discover_api_server(&handler, &rule);
        }
    }

    /// Number of installed pipelines
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Installed rules, sorted by name
    pub fn rules(&self) -> Vec<RuleSummary> {
        self.lock()
            .values()
            .map(|p| RuleSummary {
                name: p.rule.name.clone(),
                plugin_type: p.rule.plugin_type.clone(),
                resource_type: p.filter.kind(),
                targets: p.handler.count(),
            })
            .collect()
    }

    /// All targets held by rule pipelines and annotation discovery
    pub fn targets(&self) -> Vec<TargetSummary> {
        let handlers: Vec<(String, String, Arc<TargetHandler>)> = self
            .lock()
            .values()
            .map(|p| (p.rule.name.clone(), p.rule.plugin_type.clone(), p.handler.clone()))
            .collect();

        let mut targets = Vec::new();
        for (rule, plugin_type, handler) in handlers {
            targets.extend(handler.targets().into_iter().map(|(name, config)| TargetSummary {
                name,
                rule: rule.clone(),
                plugin_type: plugin_type.clone(),
                config,
            }));
        }
        targets.extend(
            self.annotations
                .targets()
                .into_iter()
                .map(|(name, config)| TargetSummary {
                    name,
                    rule: ANNOTATION_PIPELINE.to_string(),
                    plugin_type: "prometheus".to_string(),
                    config,
                }),
        );
        targets
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    /// Compile a rule and install it, returning API server work to run outside the lock
    fn install(
        &self,
        pipelines: &mut BTreeMap<String, Pipeline>,
        rule: &PluginConfig,
    ) -> Result<Option<(Arc<TargetHandler>, PluginConfig)>> {
        let filter = ResourceFilter::new(rule)?;

        let handler = match pipelines.get_mut(&rule.name) {
            Some(pipeline) if pipeline.rule.plugin_type == rule.plugin_type => {
                // same plugin type: keep the handler and its targets
                pipeline.filter = filter.clone();
                pipeline.rule = rule.clone();
                debug!(rule = %rule.name, "replaced discovery rule");
                pipeline.handler.clone()
            }
            _ => {
                let handler = self.make_handler(rule)?;
                if Self::teardown(pipelines, &rule.name) {
                    warn!(rule = %rule.name, plugin_type = %rule.plugin_type, "rule type changed, recreated pipeline");
                }
                pipelines.insert(
                    rule.name.clone(),
                    Pipeline {
                        filter: filter.clone(),
                        rule: rule.clone(),
                        handler: handler.clone(),
                    },
                );
                info!(rule = %rule.name, plugin_type = %rule.plugin_type, "installed discovery rule");
                handler
            }
        };

        if filter.kind() == ResourceKind::ApiServer {
            return Ok(Some((handler, rule.clone())));
        }
        Ok(None)
    }

    fn make_handler(&self, rule: &PluginConfig) -> Result<Arc<TargetHandler>> {
        let family = encoder::family(&rule.plugin_type)?;
        let encoder = self.encoders.resolve(&rule.plugin_type)?;
        let factory = SourceFactory::for_family(family)?;
        let registry = self
            .registries
            .get_or_create(&registry_name(&rule.plugin_type));

        Ok(TargetHandler::new(
            ProviderInfo {
                handler: self.providers.clone(),
                factory: Arc::new(factory),
                encoder,
            },
            registry,
            HandlerOptions {
                logger: Some(self.logger.clone()),
                ..Default::default()
            },
        ))
    }

    fn teardown(pipelines: &mut BTreeMap<String, Pipeline>, name: &str) -> bool {
        match pipelines.remove(name) {
            Some(pipeline) => {
                pipeline.handler.close();
                true
            }
            None => false,
        }
    }

    fn discover_by_annotation(&self, resource: &Resource, name: &str) {
        if resource.kind == ResourceKind::ApiServer {
            return;
        }
        let allowed = match self.policy.read() {
            Ok(policy) => policy.allows(resource),
            Err(e) => e.into_inner().allows(resource),
        };
        if allowed {
            self.annotations.handle(resource, None);
        } else {
            self.annotations.delete(name);
        }
    }

    fn discover_api_server(&self, handler: &Arc<TargetHandler>, rule: &PluginConfig) {
        if !self.leadership.leading() {
            debug!(rule = %rule.name, "not the leader, skipping api server rule");
            return;
        }
        let mut rule = rule.clone();
        if rule.port.is_empty() {
            rule.port = API_SERVER_PORT.to_string();
        }
        if rule.scheme.is_empty() {
            rule.scheme = API_SERVER_SCHEME.to_string();
        }
        handler.handle(&Resource::api_server(), Some(&rule));
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Pipeline>> {
        self.pipelines.lock().unwrap_or_else(|e| e.into_inner())
    }
}
