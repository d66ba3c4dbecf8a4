//! Observability infrastructure for the discovery agent
//!
//! Provides:
//! - Prometheus metrics (registered targets, rule count, leadership, error counters)
//! - Structured JSON logging with tracing

use prometheus::{
    register_int_counter, register_int_gauge, register_int_gauge_vec, IntCounter, IntGauge,
    IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<DiscoveryMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct DiscoveryMetricsInner {
    targets_registered: IntGaugeVec,
    rules_count: IntGauge,
    discovery_enabled: IntGauge,
    leader_election_leading: IntGauge,
    leader_election_errors: IntCounter,
    provider_build_errors: IntCounter,
    encoding_errors: IntCounter,
    config_reloads: IntCounter,
}

impl DiscoveryMetricsInner {
    fn new() -> Self {
        Self {
            targets_registered: register_int_gauge_vec!(
                "discovery_targets_registered",
                "Number of discovered targets per plugin family",
                &["type"]
            )
            .expect("Failed to register targets_registered"),

            rules_count: register_int_gauge!(
                "discovery_rules_count",
                "Number of installed discovery rules"
            )
            .expect("Failed to register rules_count"),

            discovery_enabled: register_int_gauge!(
                "discovery_enabled",
                "Whether discovery is running on this agent"
            )
            .expect("Failed to register discovery_enabled"),

            leader_election_leading: register_int_gauge!(
                "discovery_leader_election_leading",
                "Whether this agent is the elected leader"
            )
            .expect("Failed to register leader_election_leading"),

            leader_election_errors: register_int_counter!(
                "discovery_leader_election_errors_total",
                "Total number of leader election failures"
            )
            .expect("Failed to register leader_election_errors"),

            provider_build_errors: register_int_counter!(
                "discovery_provider_build_errors_total",
                "Total number of failures building metric source providers"
            )
            .expect("Failed to register provider_build_errors"),

            encoding_errors: register_int_counter!(
                "discovery_encoding_errors_total",
                "Total number of resources that could not be encoded"
            )
            .expect("Failed to register encoding_errors"),

            config_reloads: register_int_counter!(
                "discovery_config_reloads_total",
                "Total number of applied discovery configuration changes"
            )
            .expect("Failed to register config_reloads"),
        }
    }
}

/// Discovery metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct DiscoveryMetrics {
    _private: (),
}

impl Default for DiscoveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(DiscoveryMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &DiscoveryMetricsInner {
        GLOBAL_METRICS.get_or_init(DiscoveryMetricsInner::new)
    }

    /// Publish the number of targets held by a registry
    pub fn set_targets_registered(&self, family: &str, count: usize) {
        self.inner()
            .targets_registered
            .with_label_values(&[family])
            .set(count as i64);
    }

    pub fn set_rules_count(&self, count: usize) {
        self.inner().rules_count.set(count as i64);
    }

    pub fn set_discovery_enabled(&self, enabled: bool) {
        self.inner().discovery_enabled.set(i64::from(enabled));
    }

    pub fn set_leading(&self, leading: bool) {
        self.inner().leader_election_leading.set(i64::from(leading));
    }

    pub fn inc_leader_election_errors(&self) {
        self.inner().leader_election_errors.inc();
    }

    pub fn inc_provider_build_errors(&self) {
        self.inner().provider_build_errors.inc();
    }

    pub fn inc_encoding_errors(&self) {
        self.inner().encoding_errors.inc();
    }

    pub fn encoding_errors(&self) -> u64 {
        self.inner().encoding_errors.get()
    }

    pub fn inc_config_reloads(&self) {
        self.inner().config_reloads.inc();
    }
}

/// Structured logger for discovery events
///
/// Provides consistent JSON-formatted logging for target lifecycle,
/// leadership transitions and rule reconciliation.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log a target being added, updated or removed
    pub fn log_target_change(&self, action: &str, target: &str, plugin_type: &str) {
        info!(
            event = "target_changed",
            node = %self.node_name,
            action = %action,
            target = %target,
            plugin_type = %plugin_type,
            "Discovered target changed"
        );
    }

    /// Log the outcome of reconciling a rule set
    pub fn log_reconcile(&self, installed: usize, removed: usize, failed: usize) {
        if failed > 0 {
            warn!(
                event = "rules_reconciled",
                node = %self.node_name,
                installed = installed,
                removed = removed,
                failed = failed,
                "Reconciled discovery rules with errors"
            );
        } else {
            info!(
                event = "rules_reconciled",
                node = %self.node_name,
                installed = installed,
                removed = removed,
                "Reconciled discovery rules"
            );
        }
    }

    /// Log a leadership transition
    pub fn log_leadership(&self, leading: bool, leader: &str) {
        info!(
            event = "leadership_changed",
            node = %self.node_name,
            leading = leading,
            leader = %leader,
            "Leadership changed"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, daemon: bool) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            daemon = daemon,
            "Discovery agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Discovery agent shutting down"
        );
    }
}
