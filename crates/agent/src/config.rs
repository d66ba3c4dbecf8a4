//! Agent configuration

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

const NODE_NAME_ENV: &str = "NODE_NAME";
const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
const DEFAULT_NAMESPACE: &str = "default";

/// Agent configuration, read from `DISCOVERY_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name, `NODE_NAME` from the downward API when unset
    #[serde(default)]
    pub node_name: String,

    /// Namespace of the agent, used for the leader lease and ConfigMaps.
    /// `POD_NAMESPACE` from the downward API when unset
    #[serde(default)]
    pub namespace: String,

    /// API server port for health, metrics and the discovery API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Wired discovery configuration file
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// One agent per node: pods are limited to this node and cluster
    /// resources need leader election
    #[serde(default = "default_true")]
    pub daemon: bool,

    /// Discover services and the API server
    #[serde(default = "default_true")]
    pub scrape_cluster: bool,

    /// Lease used for leader election in daemon mode
    #[serde(default = "default_lease_name")]
    pub lease_name: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/discovery/discovery.yaml")
}

fn default_true() -> bool {
    true
}

fn default_lease_name() -> String {
    "discovery-agent-leader".to_string()
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Self::from_env(config::Environment::with_prefix("DISCOVERY"), |key| {
            std::env::var(key).ok()
        })
    }

    /// Build from `env`, taking the pod identity from `downward` when not configured
    ///
    /// Fails in daemon mode when the node name or namespace is still unknown.
    fn from_env(
        env: config::Environment,
        downward: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut cfg: Self = config::Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .context("invalid agent configuration")?;

        let lookup = |key: &str| downward(key).filter(|value| !value.is_empty());
        if cfg.node_name.is_empty() {
            cfg.node_name = lookup(NODE_NAME_ENV).unwrap_or_default();
        }
        if cfg.namespace.is_empty() {
            cfg.namespace = lookup(POD_NAMESPACE_ENV).unwrap_or_default();
        }

        if cfg.daemon {
            if cfg.node_name.is_empty() {
                bail!("{NODE_NAME_ENV} must be set when running as a daemon");
            }
            if cfg.namespace.is_empty() {
                bail!("{POD_NAMESPACE_ENV} must be set when running as a daemon");
            }
        } else if cfg.namespace.is_empty() {
            cfg.namespace = DEFAULT_NAMESPACE.to_string();
        }
        Ok(cfg)
    }
}
