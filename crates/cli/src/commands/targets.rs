//! Target and rule listing commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, RuleSummary, TargetSummary};
use crate::output::{print_json, print_table, OutputFormat};

/// Row for targets table
#[derive(Tabled)]
struct TargetRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Type")]
    plugin_type: String,
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Endpoint")]
    endpoint: String,
    #[tabled(rename = "Discovered")]
    discovered: String,
}

impl From<&TargetSummary> for TargetRow {
    fn from(t: &TargetSummary) -> Self {
        Self {
            name: t.name.clone(),
            rule: t.rule.clone(),
            plugin_type: t.plugin_type.clone(),
            namespace: t.namespace().to_string(),
            endpoint: t.endpoint(),
            discovered: t.discovered().to_string(),
        }
    }
}

/// Row for rules table
#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "Rule")]
    name: String,
    #[tabled(rename = "Type")]
    plugin_type: String,
    #[tabled(rename = "Resource")]
    resource_type: String,
    #[tabled(rename = "Targets")]
    targets: usize,
}

/// List discovered targets
pub async fn list_targets(
    client: &ApiClient,
    plugin_type: Option<String>,
    namespace: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let targets = client
        .targets(plugin_type.as_deref(), namespace.as_deref())
        .await?;

    match format {
        OutputFormat::Json => print_json(&targets)?,
        OutputFormat::Table => {
            print_table(
                targets.iter().map(TargetRow::from).collect(),
                "No targets discovered",
            );
            if !targets.is_empty() {
                println!("\nTotal: {} targets", targets.len());
            }
        }
    }
    Ok(())
}

/// List installed discovery rules
pub async fn list_rules(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let rules = client.rules().await?;

    match format {
        OutputFormat::Json => print_json(&rules)?,
        OutputFormat::Table => print_table(
            rules
                .into_iter()
                .map(|r: RuleSummary| RuleRow {
                    name: r.name,
                    plugin_type: r.plugin_type,
                    resource_type: r.resource_type,
                    targets: r.targets,
                })
                .collect(),
            "No rules installed",
        ),
    }
    Ok(())
}
