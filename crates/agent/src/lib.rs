//! In-cluster discovery agent
//!
//! Wires the discovery engine to the Kubernetes API: resource and ConfigMap
//! watchers, Lease based leader election and the agent's HTTP API.

pub mod api;
pub mod config;
pub mod leader;
pub mod watchers;
