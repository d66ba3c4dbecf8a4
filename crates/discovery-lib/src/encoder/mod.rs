//! Encoding of matched resources into scrape configurations
//!
//! An [`Encoder`] turns a resource (and the rule that matched it, if any)
//! into a [`ScrapeConfig`]. Encoders are pure: the same inputs always give
//! the same output, and malformed parameters are returned as errors for the
//! caller to count. They are looked up by plugin type through an
//! [`EncoderRegistry`] when a rule is compiled.

mod prometheus;
mod telegraf;

pub use self::prometheus::PrometheusEncoder;
pub use self::telegraf::TelegrafEncoder;

use crate::config::{CollectionConfig, FilterConfig, PluginConfig};
use crate::error::{DiscoveryError, Result};
use crate::resource::{ObjectMeta, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Annotation overriding the metric prefix of telegraf targets
pub const PREFIX_ANNOTATION: &str = "wavefront.com/prefix";

/// Annotation toggling resource labels as tags on telegraf targets
pub const LABELS_ANNOTATION: &str = "wavefront.com/includeLabels";

/// Label never carried over as a tag
const POD_TEMPLATE_HASH: &str = "pod-template-hash";

/// Produces scrape configurations for resources
pub trait Encoder: Send + Sync {
    /// Encode a resource, `None` when it yields no target
    fn encode(
        &self,
        ip: &str,
        kind: ResourceKind,
        meta: &ObjectMeta,
        rule: Option<&PluginConfig>,
    ) -> Result<Option<ScrapeConfig>>;
}

/// How a target was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discovered {
    Rule,
    Annotation,
}

impl Discovered {
    pub fn as_str(&self) -> &'static str {
        match self {
            Discovered::Rule => "rule",
            Discovered::Annotation => "annotation",
        }
    }
}

/// TLS settings for HTTP scrapes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_file: String,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// HTTP client settings for prometheus scrapes, parsed from a rule's `conf`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default)]
    pub bearer_token_file: String,
    #[serde(default)]
    pub tls_config: TlsConfig,
}

/// Settings for a prometheus endpoint source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrometheusSourceConfig {
    pub name: String,
    pub url: String,
    pub source: String,
    pub prefix: String,
    pub discovered: Discovered,
    pub use_leader_election: bool,
    pub collection: CollectionConfig,
    pub tags: BTreeMap<String, String>,
    pub filters: FilterConfig,
    pub http_client: HttpClientConfig,
}

/// Settings for a telegraf plugin source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelegrafSourceConfig {
    pub name: String,
    pub plugins: Vec<String>,
    pub conf: String,
    pub prefix: String,
    pub discovered: Discovered,
    pub use_leader_election: bool,
    pub collection: CollectionConfig,
    pub tags: BTreeMap<String, String>,
    pub filters: FilterConfig,
}

/// Scrape configuration of a discovered target
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum ScrapeConfig {
    Prometheus(PrometheusSourceConfig),
    Telegraf(TelegrafSourceConfig),
}

impl ScrapeConfig {
    /// Target name of this configuration
    pub fn name(&self) -> &str {
        match self {
            ScrapeConfig::Prometheus(cfg) => &cfg.name,
            ScrapeConfig::Telegraf(cfg) => &cfg.name,
        }
    }

    pub fn discovered(&self) -> Discovered {
        match self {
            ScrapeConfig::Prometheus(cfg) => cfg.discovered,
            ScrapeConfig::Telegraf(cfg) => cfg.discovered,
        }
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        match self {
            ScrapeConfig::Prometheus(cfg) => &cfg.tags,
            ScrapeConfig::Telegraf(cfg) => &cfg.tags,
        }
    }
}

/// Provider family serving a plugin type
pub fn family(plugin_type: &str) -> Result<&'static str> {
    if plugin_type == "prometheus" {
        Ok("prometheus")
    } else if plugin_type.starts_with("telegraf/") && plugin_type.len() > "telegraf/".len() {
        Ok("telegraf")
    } else {
        Err(DiscoveryError::UnknownPluginType(plugin_type.to_string()))
    }
}

/// Name of the target registry shared by handlers of a plugin type
pub fn registry_name(plugin_type: &str) -> String {
    plugin_type.replace('/', ".")
}

/// Encoders keyed by plugin type
pub struct EncoderRegistry {
    encoders: HashMap<String, Arc<dyn Encoder>>,
    telegraf: Arc<dyn Encoder>,
}

impl EncoderRegistry {
    /// Registry with the built-in prometheus and telegraf encoders
    pub fn new(annotation_prefix: &str, node_name: &str) -> Self {
        let mut registry = Self {
            encoders: HashMap::new(),
            telegraf: Arc::new(TelegrafEncoder::generic()),
        };
        registry.register(
            "prometheus",
            Arc::new(PrometheusEncoder::new(annotation_prefix, node_name)),
        );
        registry.register("telegraf/redis", Arc::new(TelegrafEncoder::redis()));
        registry.register("telegraf/memcached", Arc::new(TelegrafEncoder::memcached()));
        registry
    }

    pub fn register(&mut self, plugin_type: impl Into<String>, encoder: Arc<dyn Encoder>) {
        self.encoders.insert(plugin_type.into(), encoder);
    }

    /// Resolve the encoder for a plugin type, falling back to the generic telegraf encoder
    pub fn resolve(&self, plugin_type: &str) -> Result<Arc<dyn Encoder>> {
        if let Some(encoder) = self.encoders.get(plugin_type) {
            return Ok(encoder.clone());
        }
        match family(plugin_type)? {
            "telegraf" => Ok(self.telegraf.clone()),
            _ => Err(DiscoveryError::UnknownPluginType(plugin_type.to_string())),
        }
    }
}

/// Annotation value, then rule value, then default
pub(crate) fn param(
    meta: &ObjectMeta,
    annotation: Option<&str>,
    rule_value: &str,
    default: &str,
) -> String {
    let value = annotation
        .and_then(|key| meta.annotation(key))
        .unwrap_or_default();
    if !value.is_empty() {
        return value.to_string();
    }
    if !rule_value.is_empty() {
        return rule_value.to_string();
    }
    default.to_string()
}

/// Identity tags: `<kind>=<name>` and the namespace when set
pub(crate) fn encode_meta(tags: &mut BTreeMap<String, String>, kind: ResourceKind, meta: &ObjectMeta) {
    tags.insert(kind.as_str().to_string(), meta.name.clone());
    if !meta.namespace.is_empty() {
        tags.insert("namespace".to_string(), meta.namespace.clone());
    }
}

/// Merge prefixed tags, skipping empty keys and values and the pod template hash
pub(crate) fn encode_tags(
    dest: &mut BTreeMap<String, String>,
    prefix: &str,
    tags: &BTreeMap<String, String>,
) {
    for (key, value) in tags {
        if key == POD_TEMPLATE_HASH || key.is_empty() || value.is_empty() {
            continue;
        }
        dest.insert(format!("{prefix}{key}"), value.clone());
    }
}

/// Parse a boolean parameter the way Go's `strconv.ParseBool` does
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Format an optional rule duration for use as a parameter value
pub(crate) fn format_duration(duration: Option<Duration>) -> String {
    duration
        .map(|d| humantime::format_duration(d).to_string())
        .unwrap_or_default()
}

/// Parse a duration parameter, zero meaning unset
pub(crate) fn parse_duration(value: &str) -> std::result::Result<Option<Duration>, humantime::DurationError> {
    let duration = humantime::parse_duration(value)?;
    Ok((!duration.is_zero()).then_some(duration))
}
