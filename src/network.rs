//! Cluster-relevant view of networks and endpoints.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::types::PortConfig;

/// Whether a network's state stays on this node or spans the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Local,
    Global,
}

pub struct Network {
    id: String,
    name: String,
    network_type: String,
    scope: Scope,
    ingress: bool,
    driver_tables: Vec<String>,
    driver: RwLock<Option<Arc<dyn Driver>>>,
    svc_records: tokio::sync::RwLock<HashMap<String, Vec<IpAddr>>>,
}

impl Network {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        network_type: impl Into<String>,
        scope: Scope,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            network_type: network_type.into(),
            scope,
            ingress: false,
            driver_tables: Vec::new(),
            driver: RwLock::new(None),
            svc_records: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ingress(mut self, ingress: bool) -> Self {
        self.ingress = ingress;
        self
    }

    /// Tables the network's driver wants replicated and watched.
    pub fn with_driver_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.driver_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Cluster-wide identifier; also the table store scope id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network_type(&self) -> &str {
        &self.network_type
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_ingress(&self) -> bool {
        self.ingress
    }

    pub fn driver_tables(&self) -> &[String] {
        &self.driver_tables
    }

    pub fn set_driver(&self, driver: Arc<dyn Driver>) {
        *self.driver.write() = Some(driver);
    }

    pub fn clear_driver(&self) {
        self.driver.write().take();
    }

    /// The loaded driver for this network's type.
    pub fn driver(&self) -> Result<Arc<dyn Driver>> {
        self.driver
            .read()
            .clone()
            .ok_or_else(|| Error::DriverNotLoaded(self.network_type.clone()))
    }

    /// Add a name record resolving `name` to `ip` on this network.
    pub async fn add_svc_records(&self, name: &str, ip: IpAddr) {
        let mut records = self.svc_records.write().await;
        let ips = records.entry(name.to_string()).or_default();
        if !ips.contains(&ip) {
            ips.push(ip);
            debug!("Added name record {} -> {} on network {}", name, ip, self.id);
        }
    }

    pub async fn delete_svc_records(&self, name: &str, ip: IpAddr) {
        let mut records = self.svc_records.write().await;
        if let Some(ips) = records.get_mut(name) {
            ips.retain(|a| *a != ip);
            if ips.is_empty() {
                records.remove(name);
            }
            debug!("Deleted name record {} -> {} on network {}", name, ip, self.id);
        }
    }

    /// Addresses currently recorded for `name`, oldest first.
    pub async fn lookup(&self, name: &str) -> Vec<IpAddr> {
        self.svc_records
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("network_type", &self.network_type)
            .field("scope", &self.scope)
            .field("ingress", &self.ingress)
            .finish()
    }
}

/// A driver-owned entry to replicate for an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverTableEntry {
    pub table_name: String,
    pub key: String,
    pub value: Vec<u8>,
}

/// What the driver produced when the endpoint joined its sandbox.
#[derive(Debug, Clone, Default)]
pub struct JoinInfo {
    driver_table_entries: Vec<DriverTableEntry>,
}

impl JoinInfo {
    pub fn add_table_entry(
        &mut self,
        table_name: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
    ) {
        self.driver_table_entries.push(DriverTableEntry {
            table_name: table_name.into(),
            key: key.into(),
            value,
        });
    }

    pub fn driver_table_entries(&self) -> &[DriverTableEntry] {
        &self.driver_table_entries
    }
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    id: String,
    name: String,
    network: Arc<Network>,
    anonymous: bool,
    svc_name: String,
    svc_id: String,
    virtual_ip: Option<IpAddr>,
    ingress_ports: Vec<PortConfig>,
    address: Option<IpAddr>,
    join_info: Option<JoinInfo>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, name: impl Into<String>, network: Arc<Network>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            network,
            anonymous: false,
            svc_name: String::new(),
            svc_id: String::new(),
            virtual_ip: None,
            ingress_ports: Vec::new(),
            address: None,
            join_info: None,
        }
    }

    pub fn with_anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn with_service(
        mut self,
        svc_name: impl Into<String>,
        svc_id: impl Into<String>,
        virtual_ip: Option<IpAddr>,
        ingress_ports: Vec<PortConfig>,
    ) -> Self {
        self.svc_name = svc_name.into();
        self.svc_id = svc_id.into();
        self.virtual_ip = virtual_ip;
        self.ingress_ports = ingress_ports;
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_join_info(mut self, join_info: JoinInfo) -> Self {
        self.join_info = Some(join_info);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn svc_name(&self) -> &str {
        &self.svc_name
    }

    pub fn svc_id(&self) -> &str {
        &self.svc_id
    }

    pub fn virtual_ip(&self) -> Option<IpAddr> {
        self.virtual_ip
    }

    pub fn ingress_ports(&self) -> &[PortConfig] {
        &self.ingress_ports
    }

    /// Address assigned to the endpoint's interface, once resolved.
    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn join_info(&self) -> Option<&JoinInfo> {
        self.join_info.as_ref()
    }
}
