//! Discovery configuration: rules, selectors and the documents that carry them
//!
//! Rules are loaded from YAML documents, either wired into the agent as a file
//! or sourced at runtime from annotated ConfigMaps. The [`ConfigHandler`]
//! combines both into the rule set the reconciler runs against.

mod handler;
mod loader;
mod watcher;

pub use handler::{ConfigHandler, ConfigSource, DISCOVERY_CONFIG_ANNOTATION};
pub use loader::{ConfigLoader, YamlConfigLoader};
pub use watcher::{ConfigFileWatcher, ConfigWatcherHandle};

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default annotation prefix for annotation based discovery
pub const DEFAULT_ANNOTATION_PREFIX: &str = "prometheus.io";

/// Default frequency of re-evaluating runtime configuration
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(5 * 60);

fn default_discovery_interval() -> Duration {
    DEFAULT_DISCOVERY_INTERVAL
}

/// Configuration for auto discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Frequency of re-evaluating runtime discovery configuration
    #[serde(default = "default_discovery_interval", with = "humantime_serde")]
    pub discovery_interval: Duration,

    /// Substitutes the default `prometheus.io` annotation prefix
    #[serde(default)]
    pub annotation_prefix: String,

    /// Resources matching any of these selectors are never discovered through annotations
    #[serde(default)]
    pub annotation_excludes: Vec<Selectors>,

    /// Source rules from ConfigMaps annotated with `wavefront.com/discovery-config: "true"`
    #[serde(default)]
    pub enable_runtime_plugins: bool,

    #[serde(default)]
    pub disable_annotation_discovery: bool,

    /// Discovery rules
    #[serde(default, rename = "plugins")]
    pub plugin_configs: Vec<PluginConfig>,

    /// Deprecated: ignored, retained for backwards compatibility
    #[serde(default, skip_serializing)]
    pub global: GlobalConfig,

    /// Deprecated: converted into `plugins` at load time
    #[serde(default, skip_serializing)]
    pub prom_configs: Vec<PrometheusConfig>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            annotation_prefix: String::new(),
            annotation_excludes: Vec::new(),
            enable_runtime_plugins: false,
            disable_annotation_discovery: false,
            plugin_configs: Vec::new(),
            global: GlobalConfig::default(),
            prom_configs: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    /// Annotation prefix in effect for annotation based discovery
    pub fn annotation_prefix(&self) -> &str {
        if self.annotation_prefix.is_empty() {
            DEFAULT_ANNOTATION_PREFIX
        } else {
            &self.annotation_prefix
        }
    }
}

/// Deprecated global block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    #[serde(default, with = "humantime_serde")]
    pub discovery_interval: Option<Duration>,
}

/// A named discovery rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    /// Unique name of the rule, used as the reconciliation key
    pub name: String,

    /// Plugin type, for example `prometheus` or `telegraf/redis`
    #[serde(rename = "type")]
    pub plugin_type: String,

    #[serde(default)]
    pub selectors: Selectors,

    #[serde(default, deserialize_with = "string_or_scalar")]
    pub port: String,

    #[serde(default)]
    pub scheme: String,

    #[serde(default)]
    pub path: String,

    /// Plugin specific configuration template
    #[serde(default)]
    pub conf: String,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub prefix: String,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default, rename = "includeLabels", deserialize_with = "string_or_scalar")]
    pub include_labels: String,

    #[serde(default)]
    pub filters: FilterConfig,

    #[serde(default)]
    pub collection: CollectionConfig,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, plugin_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin_type: plugin_type.into(),
            ..Default::default()
        }
    }
}

/// Collection settings handed through to the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionConfig {
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// Selectors identifying matching resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Selectors {
    /// One of `pod`, `service` or `apiserver`. Defaults to pod.
    #[serde(default, rename = "resourceType")]
    pub resource_type: String,

    /// Container image glob patterns
    #[serde(default)]
    pub images: Vec<String>,

    /// Label key to value glob patterns
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,

    /// Namespace glob patterns
    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl Selectors {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.labels.is_empty() && self.namespaces.is_empty()
    }
}

/// Metric filters applied by the provider after collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default, rename = "metricAllowList", alias = "metricWhitelist")]
    pub metric_allow_list: Vec<String>,

    #[serde(default, rename = "metricDenyList", alias = "metricBlacklist")]
    pub metric_deny_list: Vec<String>,

    #[serde(default, rename = "metricTagAllowList", alias = "metricTagWhitelist")]
    pub metric_tag_allow_list: BTreeMap<String, Vec<String>>,

    #[serde(default, rename = "metricTagDenyList", alias = "metricTagBlacklist")]
    pub metric_tag_deny_list: BTreeMap<String, Vec<String>>,

    #[serde(default, rename = "tagInclude")]
    pub tag_include: Vec<String>,

    #[serde(default, rename = "tagExclude")]
    pub tag_exclude: Vec<String>,
}

impl FilterConfig {
    pub fn is_empty(&self) -> bool {
        self.metric_allow_list.is_empty()
            && self.metric_deny_list.is_empty()
            && self.metric_tag_allow_list.is_empty()
            && self.metric_tag_deny_list.is_empty()
            && self.tag_include.is_empty()
            && self.tag_exclude.is_empty()
    }
}

/// Deprecated prometheus rule shape, use [`PluginConfig`] instead
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusConfig {
    pub name: String,
    #[serde(default, rename = "resourceType")]
    pub resource_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, deserialize_with = "string_or_scalar")]
    pub port: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub source: String,
    #[serde(default, rename = "includeLabels", deserialize_with = "string_or_scalar")]
    pub include_labels: String,
    #[serde(default)]
    pub filters: FilterConfig,
}

impl From<PrometheusConfig> for PluginConfig {
    fn from(prom: PrometheusConfig) -> Self {
        let mut selectors = Selectors {
            resource_type: prom.resource_type,
            ..Default::default()
        };
        if !prom.namespace.is_empty() {
            selectors.namespaces = vec![prom.namespace];
        }
        selectors.labels = prom
            .labels
            .into_iter()
            .map(|(key, value)| (key, vec![value]))
            .collect();

        PluginConfig {
            name: prom.name,
            plugin_type: "prometheus".to_string(),
            selectors,
            port: prom.port,
            scheme: prom.scheme,
            path: prom.path,
            source: prom.source,
            prefix: prom.prefix,
            tags: prom.tags,
            include_labels: prom.include_labels,
            filters: prom.filters,
            ..Default::default()
        }
    }
}

/// Accepts `port: 6379` and `includeLabels: true` as well as their quoted forms
fn string_or_scalar<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
        Bool(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Str(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}
