//! Error types for the discovery engine

use thiserror::Error;

/// Errors raised while compiling rules, loading configuration or building providers
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid resource type: {0}")]
    InvalidResourceType(String),

    #[error("no selectors specified for rule {0}")]
    NoSelectors(String),

    #[error("invalid port {port:?} for rule {rule}: {source}")]
    InvalidPort {
        rule: String,
        port: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("invalid plugin type: {0}")]
    UnknownPluginType(String),

    #[error("unable to parse discovery config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unable to load discovery config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to encode {target}: {reason}")]
    Encoding { target: String, reason: String },

    #[error("failed to build provider {name}: {reason}")]
    Provider { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
