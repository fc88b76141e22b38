//! netagent daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;

use netagent::config::Config;
use netagent::dns_server::run_dns_server;
use netagent::{Controller, Network};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting netagent with config: {:?}", cfg);

    let controller = Controller::new(cfg.cluster_options());
    let networks: Vec<Arc<Network>> = cfg
        .networks
        .iter()
        .map(|n| controller.add_network(n.to_network()))
        .collect();

    // Cluster agent
    if let Some(bind) = &cfg.bind {
        controller.agent_init(bind).await?;
    }
    if !cfg.join_peers.is_empty() {
        if let Err(e) = controller.agent_join(&cfg.join_peers).await {
            warn!("Failed to join cluster, running standalone: {}", e);
        }
    }
    for network in &networks {
        if let Err(e) = controller.activate_network(network).await {
            error!("Failed to activate network {}: {}", network.name(), e);
        }
    }

    // DNS Server
    let dns_controller = Arc::clone(&controller);
    let dns_bind = cfg.dns_bind;
    let dns_handle = tokio::spawn(async move {
        if let Err(e) = run_dns_server(dns_bind, dns_controller).await {
            error!("DNS server failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    dns_handle.abort();
    for network in &networks {
        if let Err(e) = controller.deactivate_network(network).await {
            warn!("Failed to deactivate network {}: {}", network.name(), e);
        }
    }
    controller.agent_close().await;

    info!("Shutdown complete.");
    Ok(())
}
