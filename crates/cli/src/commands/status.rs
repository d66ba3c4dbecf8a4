//! Agent status and health commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, format_timestamp, print_json, print_table, OutputFormat};

/// Row for health components table
#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Last Check")]
    last_check: String,
}

/// Show discovery state of the agent
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status = client.status().await?;

    match format {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            let role = if !status.daemon {
                "cluster".to_string()
            } else if status.leading {
                color_status("leading")
            } else {
                color_status("following")
            };
            let leader = if status.leader.is_empty() {
                "-".to_string()
            } else {
                status.leader.clone()
            };

            println!("{}", "Discovery Agent".bold());
            println!("{}", "=".repeat(50));
            println!("Node:                   {}", status.node_name.cyan());
            println!("Role:                   {}", role);
            println!("Leader:                 {}", leader);
            println!();
            println!("{}", "Discovery".bold());
            println!("{}", "-".repeat(50));
            println!("Rules:                  {}", status.rules);
            println!("Targets:                {}", status.targets);
            println!("Runtime sources:        {}", status.runtime_sources);

            if !status.registries.is_empty() {
                println!();
                println!("{}", "Registries".bold());
                println!("{}", "-".repeat(50));
                for (name, count) in &status.registries {
                    println!("{:<24}{}", format!("{}:", name), count);
                }
            }
        }
    }
    Ok(())
}

/// Show component health of the agent
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            println!("Overall: {}", color_status(&health.status));
            println!();
            print_table(
                health
                    .components
                    .iter()
                    .map(|(name, c)| ComponentRow {
                        name: name.clone(),
                        status: color_status(&c.status),
                        message: c.message.clone().unwrap_or_default(),
                        last_check: format_timestamp(c.last_check_timestamp),
                    })
                    .collect(),
                "No components registered",
            );
        }
    }
    Ok(())
}
