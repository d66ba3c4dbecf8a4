//! Snapshots of observed Kubernetes resources

use crate::error::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Address used for API server targets
pub const DEFAULT_API_SERVICE: &str = "kubernetes.default.svc";

/// Object name used for API server targets
pub const API_SERVER_NAME: &str = "kube-apiserver";

/// Kind of a discoverable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    Service,
    ApiServer,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
            ResourceKind::ApiServer => "apiserver",
        }
    }

    /// Parse a selector resource type, defaulting to pod when empty
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "" | "pod" => Ok(ResourceKind::Pod),
            "service" => Ok(ResourceKind::Service),
            "apiserver" => Ok(ResourceKind::ApiServer),
            other => Err(DiscoveryError::InvalidResourceType(other.to_string())),
        }
    }

    /// Cluster scoped kinds are only discovered by the elected leader
    pub fn is_cluster_scoped(&self) -> bool {
        !matches!(self, ResourceKind::Pod)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object metadata carried with every resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// A container of a pod, reduced to what selectors need
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub image: String,
    pub ports: Vec<i32>,
}

impl Container {
    pub fn new(image: impl Into<String>, ports: Vec<i32>) -> Self {
        Self {
            image: image.into(),
            ports,
        }
    }
}

/// Immutable snapshot of an observed resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    /// Scrape address (pod IP, cluster IP or API server host)
    pub ip: String,
    pub meta: ObjectMeta,
    pub containers: Vec<Container>,
}

impl Resource {
    pub fn pod(ip: impl Into<String>, meta: ObjectMeta, containers: Vec<Container>) -> Self {
        Self {
            kind: ResourceKind::Pod,
            ip: ip.into(),
            meta,
            containers,
        }
    }

    pub fn service(ip: impl Into<String>, meta: ObjectMeta) -> Self {
        Self {
            kind: ResourceKind::Service,
            ip: ip.into(),
            meta,
            containers: Vec::new(),
        }
    }

    pub fn api_server() -> Self {
        Self {
            kind: ResourceKind::ApiServer,
            ip: DEFAULT_API_SERVICE.to_string(),
            meta: ObjectMeta::new(API_SERVER_NAME, ""),
            containers: Vec::new(),
        }
    }

    /// Target name for this resource
    pub fn target_name(&self) -> String {
        target_name(self.kind, &self.meta)
    }
}

/// Deterministic target name derived from kind, namespace and name.
///
/// Kubernetes names and namespaces never contain `/`, so distinct resources
/// always get distinct names.
pub fn target_name(kind: ResourceKind, meta: &ObjectMeta) -> String {
    if meta.namespace.is_empty() {
        format!("{}/{}", kind, meta.name)
    } else {
        format!("{}/{}/{}", kind, meta.namespace, meta.name)
    }
}

/// Whether an address can be scraped
pub fn has_ip(ip: &str) -> bool {
    !ip.is_empty() && ip != "None"
}
