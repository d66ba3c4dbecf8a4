use super::{
    encode_meta, encode_tags, param, Discovered, Encoder, ScrapeConfig, TelegrafSourceConfig,
    LABELS_ANNOTATION, PREFIX_ANNOTATION,
};
use crate::config::PluginConfig;
use crate::error::Result;
use crate::resource::{has_ip, target_name, ObjectMeta, ResourceKind};
use std::collections::BTreeMap;
use tracing::debug;

/// Encodes telegraf plugin sources from rules
///
/// Telegraf targets are only produced by rules. The rule's `conf` is a
/// template where `${server}`, `${host}` and `${port}` are substituted with
/// the address of the discovered resource.
#[derive(Debug, Clone, Default)]
pub struct TelegrafEncoder {
    default_scheme: &'static str,
    default_port: &'static str,
    default_conf: &'static str,
}

impl TelegrafEncoder {
    /// Encoder for telegraf plugins without built-in defaults
    pub fn generic() -> Self {
        Self {
            default_scheme: "http",
            ..Default::default()
        }
    }

    pub fn redis() -> Self {
        Self {
            default_scheme: "tcp",
            default_port: "6379",
            default_conf: "servers = [\"${server}\"]\n",
        }
    }

    pub fn memcached() -> Self {
        Self {
            default_scheme: "tcp",
            default_port: "11211",
            default_conf: "servers = [\"${host}:${port}\"]\n",
        }
    }
}

impl Encoder for TelegrafEncoder {
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
        let Some(cfg) = rule else {
            debug!(kind = %kind, name = %meta.name, "telegraf targets require a rule");
            return Ok(None);
        };

        let plugin_name = cfg.plugin_type.replace("telegraf/", "");
        let scheme = param(meta, None, &cfg.scheme, self.default_scheme);
        let port = param(meta, None, &cfg.port, self.default_port);
        let template = param(meta, None, cfg.conf.trim(), self.default_conf);

        let server = format!("{scheme}://{ip}:{port}");
        let conf = template
            .replace("${server}", &server)
            .replace("${host}", ip)
            .replace("${port}", &port);

        let prefix = param(meta, Some(PREFIX_ANNOTATION), &cfg.prefix, "");
        let include_labels = param(meta, Some(LABELS_ANNOTATION), &cfg.include_labels, "true");

        let mut tags = BTreeMap::new();
        encode_meta(&mut tags, kind, meta);
        encode_tags(&mut tags, "", &cfg.tags);
        if include_labels == "true" {
            encode_tags(&mut tags, "label.", &meta.labels);
        }

        Ok(Some(ScrapeConfig::Telegraf(TelegrafSourceConfig {
            name: target_name(kind, meta),
            plugins: vec![plugin_name],
            conf,
            prefix,
            discovered: Discovered::Rule,
            use_leader_election: kind == ResourceKind::Service,
            collection: cfg.collection.clone(),
            tags,
            filters: cfg.filters.clone(),
        })))
    }
}
