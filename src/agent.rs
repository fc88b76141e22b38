//! Cluster agent: keeps the table store in sync with local networks and
//! endpoints.
//!
//! Every operation here short-circuits to a no-op unless the network is
//! cluster eligible, i.e. globally scoped on a controller with a live
//! agent, so single-host setups pay nothing for clustering.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use prost::Message;

use crate::controller::Controller;
use crate::dispatch::{handle_table_events, DriverTableHandler, EndpointTableHandler};
use crate::driver::{DiscoveryEvent, Driver, EventKind};
use crate::error::{Error, Result};
use crate::network::{Endpoint, Network, Scope};
use crate::networkdb::{NetworkDb, NetworkDbConfig, TableStore, WatchHandle};
use crate::resolve::resolve_addr;
use crate::service::ServiceBinding;
use crate::types::{EndpointRecord, PortConfig, ENDPOINT_TABLE};

pub struct Agent {
    bind_addr: String,
    store: Arc<dyn TableStore>,
    ep_table_watch: Mutex<Option<WatchHandle>>,
    /// Driver table watches per network id, guarded so concurrent driver
    /// activations never lose a handle.
    driver_watches: Mutex<HashMap<String, Vec<WatchHandle>>>,
}

impl Agent {
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    /// Number of live driver table watches for a network.
    pub fn driver_watch_count(&self, network_id: &str) -> usize {
        self.driver_watches
            .lock()
            .get(network_id)
            .map_or(0, Vec::len)
    }
}

fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Failed to get hostname: {}", e);
            String::new()
        }
    }
}

impl Controller {
    /// Start the cluster agent bound to the given address or interface.
    pub async fn agent_init(self: &Arc<Self>, bind_addr_or_interface: &str) -> Result<()> {
        if !self.is_agent() {
            return Ok(());
        }
        if self.agent.read().is_some() {
            return Err(Error::AgentRunning);
        }

        let bind_addr = resolve_addr(bind_addr_or_interface)?;
        let ip: IpAddr = bind_addr
            .parse()
            .map_err(|_| Error::InvalidAddress(bind_addr.clone()))?;
        let node_name = self
            .options
            .node_name
            .clone()
            .unwrap_or_else(local_hostname);

        let store = NetworkDb::new(NetworkDbConfig {
            bind_addr: ip,
            bind_port: self.options.gossip_port,
            node_name,
            cluster_secret: self.options.cluster_secret.clone(),
        })
        .await?;
        let store: Arc<dyn TableStore> = Arc::new(store);

        if let Err(e) = self.start_agent(Arc::clone(&store), bind_addr) {
            store.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Install an agent over an already running table store and start
    /// the endpoint table watch.
    pub fn start_agent(
        self: &Arc<Self>,
        store: Arc<dyn TableStore>,
        bind_addr: String,
    ) -> Result<()> {
        let mut slot = self.agent.write();
        if slot.is_some() {
            return Err(Error::AgentRunning);
        }

        let (rx, cancel) = store.watch(ENDPOINT_TABLE, "", "");
        *slot = Some(Arc::new(Agent {
            bind_addr: bind_addr.clone(),
            store,
            ep_table_watch: Mutex::new(Some(cancel)),
            driver_watches: Mutex::new(HashMap::new()),
        }));
        drop(slot);

        tokio::spawn(handle_table_events(
            rx,
            EndpointTableHandler::new(Arc::downgrade(self)),
        ));
        info!("Cluster agent started on {}", bind_addr);
        Ok(())
    }

    /// Merge with the cluster reachable through `remotes`.
    pub async fn agent_join(&self, remotes: &[String]) -> Result<()> {
        let Some(agent) = self.agent() else {
            return Ok(());
        };
        agent.store.join(remotes).await?;
        Ok(())
    }

    /// Tell a newly activated driver the address of this node.
    pub fn agent_driver_notify(&self, driver: &dyn Driver) {
        let Some(agent) = self.agent() else {
            return;
        };

        let event = DiscoveryEvent::Node {
            address: agent.bind_addr.clone(),
            self_node: true,
        };
        if let Err(e) = driver.discover_new(&event) {
            warn!(
                "Driver {} failed to handle self discovery: {}",
                driver.network_type(),
                e
            );
        }
    }

    /// Cancel every watch, close the table store and drop the agent.
    pub async fn agent_close(&self) {
        let agent = self.agent.write().take();
        let Some(agent) = agent else {
            return;
        };

        let driver_watches: Vec<WatchHandle> = agent
            .driver_watches
            .lock()
            .drain()
            .flat_map(|(_, handles)| handles)
            .collect();
        for handle in driver_watches {
            handle.cancel();
        }
        let ep_watch = agent.ep_table_watch.lock().take();
        if let Some(handle) = ep_watch {
            handle.cancel();
        }

        agent.store.close().await;
        info!("Cluster agent stopped");
    }

    pub fn is_cluster_eligible(&self, network: &Network) -> bool {
        self.cluster_agent(network).is_some()
    }

    /// The agent to use for `network`, or `None` when the network does not
    /// take part in clustering.
    fn cluster_agent(&self, network: &Network) -> Option<Arc<Agent>> {
        if network.scope() != Scope::Global {
            return None;
        }
        self.agent()
    }

    pub async fn join_cluster(&self, network: &Network) -> Result<()> {
        let Some(agent) = self.cluster_agent(network) else {
            return Ok(());
        };
        agent.store.join_network(network.id()).await?;
        debug!("Joined cluster namespace of network {}", network.id());
        Ok(())
    }

    pub async fn leave_cluster(&self, network: &Network) -> Result<()> {
        let Some(agent) = self.cluster_agent(network) else {
            return Ok(());
        };
        agent.store.leave_network(network.id()).await?;
        debug!("Left cluster namespace of network {}", network.id());
        Ok(())
    }

    /// Publish an endpoint and its driver table entries.
    ///
    /// Stops at the first failing entry without undoing the ones already
    /// created.
    pub async fn add_to_cluster(&self, ep: &Endpoint) -> Result<()> {
        let n = ep.network();
        let Some(agent) = self.cluster_agent(n) else {
            return Ok(());
        };

        if let (false, Some(ip)) = (ep.is_anonymous(), ep.address()) {
            let mut ingress_ports = Vec::new();
            if !ep.svc_id().is_empty() {
                // Ingress ports are only gossiped on the ingress network.
                if n.is_ingress() {
                    ingress_ports = ep.ingress_ports().to_vec();
                }
                self.add_service_binding(&service_binding(ep, ingress_ports.clone(), ip))
                    .await?;
            }

            let record = EndpointRecord {
                name: ep.name().to_string(),
                service_name: ep.svc_name().to_string(),
                service_id: ep.svc_id().to_string(),
                virtual_ip: ep.virtual_ip().map(|v| v.to_string()).unwrap_or_default(),
                ingress_ports,
                endpoint_ip: ip.to_string(),
            };
            agent
                .store
                .create_entry(ENDPOINT_TABLE, n.id(), ep.id(), record.encode_to_vec())
                .await?;
        }

        if let Some(join_info) = ep.join_info() {
            for te in join_info.driver_table_entries() {
                agent
                    .store
                    .create_entry(&te.table_name, n.id(), &te.key, te.value.clone())
                    .await?;
            }
        }

        debug!("Published endpoint {} on network {}", ep.id(), n.id());
        Ok(())
    }

    /// Retract what [`Controller::add_to_cluster`] published.
    ///
    /// The endpoint record is only deleted for a non-anonymous endpoint
    /// with a resolved address, the same condition under which it was
    /// published. Driver table entries are deleted when join info is set.
    pub async fn delete_from_cluster(&self, ep: &Endpoint) -> Result<()> {
        let n = ep.network();
        let Some(agent) = self.cluster_agent(n) else {
            return Ok(());
        };

        if let (false, Some(ip)) = (ep.is_anonymous(), ep.address()) {
            if !ep.svc_id().is_empty() {
                let ingress_ports = if n.is_ingress() {
                    ep.ingress_ports().to_vec()
                } else {
                    Vec::new()
                };
                self.rm_service_binding(&service_binding(ep, ingress_ports, ip))
                    .await?;
            }

            agent
                .store
                .delete_entry(ENDPOINT_TABLE, n.id(), ep.id())
                .await?;
        }

        if let Some(join_info) = ep.join_info() {
            for te in join_info.driver_table_entries() {
                agent
                    .store
                    .delete_entry(&te.table_name, n.id(), &te.key)
                    .await?;
            }
        }

        debug!("Retracted endpoint {} from network {}", ep.id(), n.id());
        Ok(())
    }

    /// Watch every driver table of `network` and replay the entries that
    /// already exist to its driver.
    pub fn add_driver_watches(&self, network: &Arc<Network>) {
        let Some(agent) = self.cluster_agent(network) else {
            return;
        };

        for table in network.driver_tables() {
            let (rx, handle) = agent.store.watch(table, network.id(), "");
            agent
                .driver_watches
                .lock()
                .entry(network.id().to_string())
                .or_default()
                .push(handle);

            tokio::spawn(handle_table_events(
                rx,
                DriverTableHandler::new(Arc::clone(network)),
            ));

            let driver = match network.driver() {
                Ok(d) => d,
                Err(e) => {
                    error!(
                        "Could not resolve driver {} while walking driver table {}: {}",
                        network.network_type(),
                        table,
                        e
                    );
                    continue;
                }
            };

            let mut replayed = 0;
            agent.store.walk_table(table, &mut |nid, key, value| {
                if nid == network.id() {
                    driver.event_notify(EventKind::Create, network.id(), table, key, value);
                    replayed += 1;
                }
                false
            });
            debug!(
                "Watching driver table {} on network {} ({} entries replayed)",
                table,
                network.id(),
                replayed
            );
        }
    }

    pub fn cancel_driver_watches(&self, network: &Network) {
        let Some(agent) = self.cluster_agent(network) else {
            return;
        };

        let handles = agent
            .driver_watches
            .lock()
            .remove(network.id())
            .unwrap_or_default();
        debug!(
            "Cancelling {} driver table watches on network {}",
            handles.len(),
            network.id()
        );
        for handle in handles {
            handle.cancel();
        }
    }
}

fn service_binding(ep: &Endpoint, ingress_ports: Vec<PortConfig>, ip: IpAddr) -> ServiceBinding {
    ServiceBinding {
        service_name: ep.svc_name().to_string(),
        service_id: ep.svc_id().to_string(),
        network_id: ep.network().id().to_string(),
        endpoint_id: ep.id().to_string(),
        virtual_ip: ep.virtual_ip(),
        ingress_ports,
        endpoint_ip: ip,
    }
}
