//! The network controller as seen by the cluster agent.
//!
//! The controller owns the registered networks, the service registry and
//! the optional [`Agent`]. Whether the agent is present is the only test
//! of whether this node participates in a cluster.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::service::{ServiceBinding, ServiceRegistry};

/// Default gossip port of the table store.
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Run a cluster agent at all.
    pub enabled: bool,
    pub gossip_port: u16,
    /// Node name announced to peers; defaults to the host name.
    pub node_name: Option<String>,
    pub cluster_secret: String,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            gossip_port: DEFAULT_GOSSIP_PORT,
            node_name: None,
            cluster_secret: String::new(),
        }
    }
}

pub struct Controller {
    pub(crate) options: ClusterOptions,
    pub(crate) agent: RwLock<Option<Arc<Agent>>>,
    networks: RwLock<HashMap<String, Arc<Network>>>,
    services: ServiceRegistry,
}

impl Controller {
    pub fn new(options: ClusterOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            agent: RwLock::new(None),
            networks: RwLock::new(HashMap::new()),
            services: ServiceRegistry::new(),
        })
    }

    /// Whether this controller is configured to run a cluster agent.
    pub fn is_agent(&self) -> bool {
        self.options.enabled
    }

    /// The live agent, if clustering has been started.
    pub fn agent(&self) -> Option<Arc<Agent>> {
        self.agent.read().clone()
    }

    pub fn add_network(&self, network: Network) -> Arc<Network> {
        let network = Arc::new(network);
        self.networks
            .write()
            .insert(network.id().to_string(), Arc::clone(&network));
        network
    }

    pub fn remove_network(&self, id: &str) -> Option<Arc<Network>> {
        self.networks.write().remove(id)
    }

    pub fn network_by_id(&self, id: &str) -> Result<Arc<Network>> {
        self.networks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NetworkNotFound(id.to_string()))
    }

    /// Registered networks ordered by id.
    pub fn networks(&self) -> Vec<Arc<Network>> {
        let mut networks: Vec<Arc<Network>> = self.networks.read().values().cloned().collect();
        networks.sort_by(|a, b| a.id().cmp(b.id()));
        networks
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Bind an endpoint to its service and publish the service name on
    /// the endpoint's network once the service has a backend there.
    pub async fn add_service_binding(&self, binding: &ServiceBinding) -> Result<()> {
        let Some(record_ip) = self.services.add(binding)? else {
            return Ok(());
        };
        match self.network_by_id(&binding.network_id) {
            Ok(n) => n.add_svc_records(&binding.service_name, record_ip).await,
            Err(e) => warn!(
                "No name record for service {}: {}",
                binding.service_name, e
            ),
        }
        Ok(())
    }

    pub async fn rm_service_binding(&self, binding: &ServiceBinding) -> Result<()> {
        let Some(record_ip) = self.services.remove(binding) else {
            return Ok(());
        };
        if let Ok(n) = self.network_by_id(&binding.network_id) {
            n.delete_svc_records(&binding.service_name, record_ip).await;
        }
        Ok(())
    }

    /// First address recorded for `name` on any network.
    pub async fn resolve_name(&self, name: &str) -> Option<IpAddr> {
        for network in self.networks() {
            if let Some(ip) = network.lookup(name).await.first() {
                return Some(*ip);
            }
        }
        None
    }

    /// Bring a network into the cluster: join its replicated namespace,
    /// tell its driver where this node lives and start the driver watches.
    pub async fn activate_network(&self, network: &Arc<Network>) -> Result<()> {
        self.join_cluster(network).await?;
        if let Ok(driver) = network.driver() {
            self.agent_driver_notify(driver.as_ref());
        }
        self.add_driver_watches(network);
        info!("Activated network {} ({})", network.name(), network.id());
        Ok(())
    }

    pub async fn deactivate_network(&self, network: &Arc<Network>) -> Result<()> {
        self.cancel_driver_watches(network);
        self.leave_cluster(network).await?;
        info!("Deactivated network {} ({})", network.name(), network.id());
        Ok(())
    }
}
