//! Discovery agent CLI
//!
//! Queries a discovery agent's HTTP API for discovered targets, installed
//! rules, leadership state and health.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{status, targets};

/// Discovery agent CLI
#[derive(Parser)]
#[command(name = "discoctl")]
#[command(author, version, about = "CLI for the Kubernetes discovery agent", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via DISCOCTL_API_URL env var)
    #[arg(long, env = "DISCOCTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List discovered scrape targets
    Targets {
        /// Filter by plugin type (e.g. prometheus, telegraf/redis)
        #[arg(long = "type", short = 't')]
        plugin_type: Option<String>,

        /// Filter by namespace
        #[arg(long, short)]
        namespace: Option<String>,
    },

    /// List installed discovery rules
    Rules,

    /// Show agent discovery and leadership state
    Status,

    /// Show agent component health
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = client::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Targets {
            plugin_type,
            namespace,
        } => targets::list_targets(&client, plugin_type, namespace, cli.format).await?,
        Commands::Rules => targets::list_rules(&client, cli.format).await?,
        Commands::Status => status::show_status(&client, cli.format).await?,
        Commands::Health => status::show_health(&client, cli.format).await?,
    }

    Ok(())
}
