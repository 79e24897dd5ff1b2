//! mcp-aggregation-gateway — entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcp_gateway::backend::BackendRegistry;
use mcp_gateway::catalog;
use mcp_gateway::config::{Cli, GatewayConfig};
use mcp_gateway::credentials::CredentialStore;
use mcp_gateway::health::{self, HealthMonitor};
use mcp_gateway::inventory::ToolInventory;
use mcp_gateway::lifecycle::{self, LifecycleManager};
use mcp_gateway::pathtranslate::PathTranslator;
use mcp_gateway::router::Router as GatewayRouter;
use mcp_gateway::server::GatewayServer;

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::from_cli(cli);

    init_tracing(&config.log_level, config.json_logs);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting mcp-aggregation-gateway");

    let credentials = Arc::new(CredentialStore::load(config.credentials_path.clone()).await?);

    let (gateway_section, specs) = catalog::load_catalog(&config.config_path).await?;
    let api_key = config.api_key_override.clone().or(gateway_section.api_key);

    let registry = Arc::new(BackendRegistry::new());
    for spec in specs {
        registry.add(spec);
    }

    let inventory = Arc::new(ToolInventory::new(Some(config.inventory_path.clone())));
    inventory.load().await?;

    // Startup: auto-start backends are brought up and discovered eagerly;
    // lazy ones wait for their first routed call.
    for backend in registry.iter() {
        if !backend.is_lazy_start() {
            if let Err(err) = backend.start().await {
                tracing::warn!(backend = %backend.id, error = %err, "auto-start backend failed to come up");
                continue;
            }
            if let Err(err) = inventory.discover(&backend).await {
                tracing::warn!(backend = %backend.id, error = %err, "initial discovery failed");
            }
        }
    }

    let lifecycle = Arc::new(LifecycleManager::new());
    lifecycle::spawn_sweeper(Arc::clone(&lifecycle), Arc::clone(&registry), Arc::clone(&inventory));

    let health_monitor = Arc::new(HealthMonitor::new());
    health::spawn_health_loop(Arc::clone(&health_monitor), Arc::clone(&registry));

    let path_translator = Arc::new(PathTranslator::default());

    let router = Arc::new(GatewayRouter::new(
        Arc::clone(&registry),
        Arc::clone(&inventory),
        Arc::clone(&credentials),
        Arc::clone(&lifecycle),
        path_translator,
    ));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let server = GatewayServer::new(router, health_monitor, Arc::clone(&registry), Arc::clone(&lifecycle), api_key);

    server.run(addr).await?;

    tracing::info!("stopping all backends before exit");
    for backend in registry.iter() {
        let _ = backend.stop().await;
    }

    Ok(())
}
