use super::{
    encode_meta, encode_tags, format_duration, param, parse_bool, parse_duration, Discovered,
    Encoder, HttpClientConfig, PrometheusSourceConfig, ScrapeConfig, TlsConfig,
};
use crate::config::{CollectionConfig, PluginConfig, DEFAULT_ANNOTATION_PREFIX};
use crate::error::{DiscoveryError, Result};
use crate::resource::{has_ip, target_name, ObjectMeta, ResourceKind};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Annotation keys under a configurable prefix
#[derive(Debug, Clone)]
struct Annotations {
    scrape: String,
    scheme: String,
    path: String,
    port: String,
    prefix: String,
    labels: String,
    source: String,
    collection_interval: String,
    timeout: String,
    insecure_skip_verify: String,
    server_name: String,
}

impl Annotations {
    fn new(prefix: &str) -> Self {
        let prefix = if prefix.is_empty() {
            DEFAULT_ANNOTATION_PREFIX
        } else {
            prefix
        };
        let key = |name: &str| format!("{prefix}/{name}");
        Self {
            scrape: key("scrape"),
            scheme: key("scheme"),
            path: key("path"),
            port: key("port"),
            prefix: key("prefix"),
            labels: key("includeLabels"),
            source: key("source"),
            collection_interval: key("collectionInterval"),
            timeout: key("timeout"),
            insecure_skip_verify: key("insecureSkipVerify"),
            server_name: key("serverName"),
        }
    }
}

/// Encodes prometheus endpoints from rules or `<prefix>/scrape` annotations
#[derive(Clone)]
pub struct PrometheusEncoder {
    annotations: Annotations,
    /// Default source for discovered targets
    node_name: String,
}

impl PrometheusEncoder {
    pub fn new(annotation_prefix: &str, node_name: impl Into<String>) -> Self {
        Self {
            annotations: Annotations::new(annotation_prefix),
            node_name: node_name.into(),
        }
    }

    /// Annotation marking a resource for annotation based discovery
    pub fn scrape_annotation(&self) -> &str {
        &self.annotations.scrape
    }

    fn duration(
        &self,
        kind: ResourceKind,
        meta: &ObjectMeta,
        key: &str,
        rule_value: &str,
        what: &str,
    ) -> Result<Option<Duration>> {
        let value = param(meta, Some(key), rule_value, "0s");
        parse_duration(&value).map_err(|e| DiscoveryError::Encoding {
            target: target_name(kind, meta),
            reason: format!("invalid {what} {value:?}: {e}"),
        })
    }
}

impl Encoder for PrometheusEncoder {
    fn encode(
        &self,
        ip: &str,
        kind: ResourceKind,
        meta: &ObjectMeta,
        rule: Option<&PluginConfig>,
    ) -> Result<Option<ScrapeConfig>> {
        if !has_ip(ip) {
            debug!(kind = %kind, name = %meta.name, "missing ip");
            return Ok(None);
        }

        let default_rule = PluginConfig::default();
        let (cfg, discovered) = match rule {
            Some(rule) => (rule, Discovered::Rule),
            None => (&default_rule, Discovered::Annotation),
        };
        let keys = &self.annotations;

        let scrape = param(meta, Some(keys.scrape.as_str()), "", "false");
        if rule.is_none() && scrape != "true" {
            debug!(kind = %kind, name = %meta.name, "prometheus scrape=false");
            return Ok(None);
        }

        let interval = self.duration(
            kind,
            meta,
            &keys.collection_interval,
            &format_duration(cfg.collection.interval),
            "collection interval",
        )?;
        let timeout = self.duration(
            kind,
            meta,
            &keys.timeout,
            &format_duration(cfg.collection.timeout),
            "timeout",
        )?;

        let scheme = param(meta, Some(keys.scheme.as_str()), &cfg.scheme, "http");
        let path = param(meta, Some(keys.path.as_str()), &cfg.path, "/metrics");
        let port = param(meta, Some(keys.port.as_str()), &cfg.port, "");
        let prefix = param(meta, Some(keys.prefix.as_str()), &cfg.prefix, "");
        let mut source = param(meta, Some(keys.source.as_str()), &cfg.source, &self.node_name);
        let include_labels = param(meta, Some(keys.labels.as_str()), &cfg.include_labels, "true");
        let insecure_skip_verify = param(meta, Some(keys.insecure_skip_verify.as_str()), "", "true");
        let server_name = param(meta, Some(keys.server_name.as_str()), "", "");

        if source.is_empty() {
            source = meta.name.clone();
        }
        let port = sanitize_port(&meta.name, port);
        let port = if port.is_empty() {
            port
        } else {
            format!(":{port}")
        };

        let http_client = if cfg.conf.trim().is_empty() {
            HttpClientConfig {
                tls_config: TlsConfig {
                    insecure_skip_verify: parse_bool(&insecure_skip_verify).unwrap_or(false),
                    server_name,
                    ..Default::default()
                },
                ..Default::default()
            }
        } else {
            serde_yaml::from_str(&cfg.conf).map_err(|e| DiscoveryError::Encoding {
                target: target_name(kind, meta),
                reason: format!("invalid http client conf in rule {}: {e}", cfg.name),
            })?
        };

        let mut tags = BTreeMap::new();
        encode_meta(&mut tags, kind, meta);
        encode_tags(&mut tags, "", &cfg.tags);
        if include_labels == "true" {
            encode_tags(&mut tags, "label.", &meta.labels);
        }

        Ok(Some(ScrapeConfig::Prometheus(PrometheusSourceConfig {
            name: target_name(kind, meta),
            url: format!("{scheme}://{ip}{port}{path}"),
            source,
            prefix,
            discovered,
            // cluster level resources are only scraped by the leader
            use_leader_election: kind == ResourceKind::Service,
            collection: CollectionConfig { interval, timeout },
            tags,
            filters: cfg.filters.clone(),
            http_client,
        })))
    }
}

fn sanitize_port(name: &str, port: String) -> String {
    if port.is_empty() && name.contains("kube-state-metrics") {
        debug!(name = %name, "using port 8080");
        return "8080".to_string();
    }
    port
}
