//! API client for the discovery agent

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// API client for a single discovery agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request, failing on any non-success status
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        self.fetch(path, query, &[]).await
    }

    /// Discovered targets, optionally filtered by plugin type and namespace
    pub async fn targets(
        &self,
        plugin_type: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Vec<TargetSummary>> {
        let mut query = Vec::new();
        if let Some(plugin_type) = plugin_type {
            query.push(("type", plugin_type));
        }
        if let Some(namespace) = namespace {
            query.push(("namespace", namespace));
        }
        self.get("api/v1/targets", &query).await
    }

    pub async fn rules(&self) -> Result<Vec<RuleSummary>> {
        self.get("api/v1/rules", &[]).await
    }

    pub async fn status(&self) -> Result<AgentStatus> {
        self.get("api/v1/status", &[]).await
    }

    /// Agent health; an unhealthy agent still answers with a body
    pub async fn health(&self) -> Result<HealthReport> {
        self.fetch("healthz", &[], &[StatusCode::SERVICE_UNAVAILABLE])
            .await
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        accepted: &[StatusCode],
    ) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() && !accepted.contains(&status) {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSummary {
    pub name: String,
    pub rule: String,
    pub plugin_type: String,
    /// Scrape configuration, tagged by `family`
    pub config: serde_json::Value,
}

impl TargetSummary {
    pub fn namespace(&self) -> &str {
        self.config["tags"]["namespace"].as_str().unwrap_or_default()
    }

    pub fn discovered(&self) -> &str {
        self.config["discovered"].as_str().unwrap_or_default()
    }

    /// Scrape URL for prometheus targets, plugin names for telegraf targets
    pub fn endpoint(&self) -> String {
        if let Some(url) = self.config["url"].as_str() {
            return url.to_string();
        }
        self.config["plugins"]
            .as_array()
            .map(|plugins| {
                plugins
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSummary {
    pub name: String,
    pub plugin_type: String,
    pub resource_type: String,
    pub targets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub node_name: String,
    pub daemon: bool,
    pub leading: bool,
    pub leader: String,
    pub rules: usize,
    pub targets: usize,
    pub runtime_sources: usize,
    pub registries: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}
