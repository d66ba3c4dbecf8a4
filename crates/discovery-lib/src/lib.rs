//! Kubernetes scrape target discovery
//!
//! This crate provides the discovery engine used by the agent:
//! - Rule and annotation based discovery of pods, services and the API server
//! - Encoding of discovered resources into prometheus and telegraf scrape configs
//! - Target bookkeeping with provider lifecycle management
//! - Runtime configuration sourced from files and ConfigMaps
//! - Leader election gating for cluster scoped resources
//! - Health checks and observability

pub mod config;
pub mod discoverer;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod handler;
pub mod health;
pub mod leadership;
pub mod manager;
pub mod observability;
pub mod providers;
pub mod registry;
pub mod resource;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use config::{ConfigHandler, ConfigSource, DiscoveryConfig, PluginConfig, Selectors};
pub use discoverer::{Discoverer, RuleSummary, TargetSummary};
pub use encoder::ScrapeConfig;
pub use error::{DiscoveryError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use leadership::{Elector, Leadership, LeadershipGate};
pub use manager::{DiscoveryManager, ManagerOptions, ResourceEvent, ResourceWatcher};
pub use observability::{DiscoveryMetrics, StructuredLogger};
pub use providers::{MetricsSourceProvider, ProviderCatalog, ProviderHandler};
pub use registry::Registries;
pub use resource::{Container, ObjectMeta, Resource, ResourceKind};
