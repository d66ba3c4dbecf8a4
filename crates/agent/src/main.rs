//! Discovery Agent - Kubernetes scrape target discovery
//!
//! This binary runs as a DaemonSet on each Kubernetes node (or as a single
//! cluster-wide deployment), discovering scrape targets from pods, services
//! and the API server.

use anyhow::{Context, Result};
use discovery_agent::{
    api,
    config::AgentConfig,
    leader::LeaseElector,
    watchers::{self, PodWatcher, ServiceWatcher},
};
use discovery_lib::{
    config::ConfigFileWatcher,
    health::{components, HealthRegistry},
    registry::REPORT_INTERVAL,
    ConfigHandler, Discoverer, DiscoveryConfig, DiscoveryManager, Leadership, ManagerOptions,
    ProviderCatalog, Registries, StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = AgentConfig::load()?;
    info!(node_name = %config.node_name, daemon = config.daemon, "agent configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::DISCOVERY).await;
    health_registry.register(components::CONFIG).await;
    health_registry.register(components::LEADERSHIP).await;

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION, config.daemon);

    let wired = if config.config_path.exists() {
        DiscoveryConfig::from_file(&config.config_path).with_context(|| {
            format!("loading discovery config {}", config.config_path.display())
        })?
    } else {
        warn!(path = %config.config_path.display(), "no discovery config file, using defaults");
        health_registry
            .set_degraded(components::CONFIG, "discovery config file missing")
            .await;
        DiscoveryConfig::default()
    };
    let config_handler = Arc::new(ConfigHandler::new(wired.clone()));
    let _config_watcher = match ConfigFileWatcher::new(&config.config_path, config_handler.clone()).start() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "config file reloads disabled");
            None
        }
    };

    let client = kube::Client::try_default()
        .await
        .context("creating kubernetes client")?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let leadership = Leadership::new(config.daemon, logger.clone());
    let elector = (config.daemon && config.scrape_cluster).then(|| {
        let elector = LeaseElector::new(
            client.clone(),
            &config.namespace,
            &config.lease_name,
            &config.node_name,
        );
        leadership.start_elector(Arc::new(elector), shutdown_tx.subscribe())
    });

    let registries = Arc::new(Registries::new());
    let reporter = registries.start_reporter(REPORT_INTERVAL, shutdown_tx.subscribe());

    let discoverer = Arc::new(Discoverer::new(
        &wired,
        &config.node_name,
        registries,
        Arc::new(ProviderCatalog::new()),
        leadership.clone(),
        logger.clone(),
    ));

    let runtime_watchers = if wired.enable_runtime_plugins {
        info!("runtime plugins enabled");
        vec![
            tokio::spawn(watchers::watch_config_maps(
                client.clone(),
                config.namespace.clone(),
                config_handler.clone(),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(watchers::watch_secrets(
                client.clone(),
                config.namespace.clone(),
                config_handler.clone(),
                shutdown_tx.subscribe(),
            )),
        ]
    } else {
        Vec::new()
    };

    let manager = DiscoveryManager::new(
        discoverer.clone(),
        config_handler.clone(),
        leadership.clone(),
        Arc::new(PodWatcher::new(
            client.clone(),
            config.daemon.then(|| config.node_name.clone()),
        )),
        Arc::new(ServiceWatcher::new(client)),
        ManagerOptions {
            scrape_cluster: config.scrape_cluster,
            discovery_interval: wired.discovery_interval,
        },
    );
    manager.start();

    let app_state = Arc::new(api::AppState {
        node_name: config.node_name.clone(),
        health_registry: health_registry.clone(),
        discoverer,
        leadership,
        config: config_handler,
    });
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    manager.stop().await;
    for task in [Some(reporter), elector]
        .into_iter()
        .flatten()
        .chain(runtime_watchers)
    {
        let _ = task.await;
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("shutdown complete");
    Ok(())
}
