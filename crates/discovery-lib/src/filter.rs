//! Rule selectors compiled into resource matchers

use crate::config::PluginConfig;
use crate::error::{DiscoveryError, Result};
use crate::resource::{Resource, ResourceKind};
use glob::Pattern;
use std::collections::BTreeMap;

/// A list of glob patterns matching when any pattern matches
#[derive(Debug, Clone)]
pub struct GlobSet {
    patterns: Vec<Pattern>,
}

impl GlobSet {
    /// Compile the patterns, `None` when the list is empty
    pub fn compile(patterns: &[String]) -> Result<Option<Self>> {
        if patterns.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            patterns: compile_patterns(patterns)?,
        }))
    }

    /// An empty set matches everything
    pub fn matches(&self, value: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(value))
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| DiscoveryError::InvalidGlob {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

/// Matches resources against the selectors of a single rule
#[derive(Debug, Clone)]
pub struct ResourceFilter {
    kind: ResourceKind,
    images: Option<GlobSet>,
    namespaces: Option<GlobSet>,
    labels: Option<BTreeMap<String, GlobSet>>,
    port: Option<i32>,
}

impl ResourceFilter {
    /// Compile the selectors of a rule
    pub fn new(rule: &PluginConfig) -> Result<Self> {
        let selectors = &rule.selectors;
        let kind = ResourceKind::parse(&selectors.resource_type)?;

        let images = GlobSet::compile(&selectors.images)?;
        let namespaces = GlobSet::compile(&selectors.namespaces)?;
        let labels = if selectors.labels.is_empty() {
            None
        } else {
            let mut compiled = BTreeMap::new();
            for (key, values) in &selectors.labels {
                // a key with no values only requires the key to exist
                let set = GlobSet {
                    patterns: compile_patterns(values)?,
                };
                compiled.insert(key.clone(), set);
            }
            Some(compiled)
        };

        if kind != ResourceKind::ApiServer
            && images.is_none()
            && namespaces.is_none()
            && labels.is_none()
        {
            return Err(DiscoveryError::NoSelectors(rule.name.clone()));
        }

        let port = if rule.port.is_empty() {
            None
        } else {
            Some(
                rule.port
                    .parse::<i32>()
                    .map_err(|source| DiscoveryError::InvalidPort {
                        rule: rule.name.clone(),
                        port: rule.port.clone(),
                        source,
                    })?,
            )
        };

        Ok(Self {
            kind,
            images,
            namespaces,
            labels,
            port,
        })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if resource.kind != self.kind {
            return false;
        }
        if let Some(labels) = &self.labels {
            if !matches_labels(labels, &resource.meta.labels) {
                return false;
            }
        }
        if let Some(namespaces) = &self.namespaces {
            if !namespaces.matches(&resource.meta.namespace) {
                return false;
            }
        }
        if let Some(images) = &self.images {
            return match resource
                .containers
                .iter()
                .find(|c| images.matches(&c.image))
            {
                Some(container) => match self.port {
                    Some(port) => container.ports.contains(&port),
                    None => true,
                },
                None => false,
            };
        }
        true
    }
}

fn matches_labels(matchers: &BTreeMap<String, GlobSet>, labels: &BTreeMap<String, String>) -> bool {
    if labels.is_empty() {
        return false;
    }
    matchers
        .iter()
        .all(|(key, set)| labels.get(key).is_some_and(|value| set.matches(value)))
}
