//! Data structures shared between the agent and the table store.
//!
//! [`EndpointRecord`] is the only payload the agent itself interprets.
//! It is stored protobuf-encoded under [`ENDPOINT_TABLE`] so every node
//! can rebuild service bindings and name records for remote endpoints.
//! All other tables carry opaque, driver-owned bytes.

use serde::{Deserialize, Serialize};

/// Reserved table holding one [`EndpointRecord`] per published endpoint.
pub const ENDPOINT_TABLE: &str = "endpoint_table";

/// Cluster-visible facts about an endpoint.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EndpointRecord {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub service_name: String,
    #[prost(string, tag = "3")]
    pub service_id: String,
    /// Textual virtual IP, empty when the service has none.
    #[prost(string, tag = "4")]
    pub virtual_ip: String,
    #[prost(message, repeated, tag = "5")]
    pub ingress_ports: Vec<PortConfig>,
    #[prost(string, tag = "6")]
    pub endpoint_ip: String,
}

/// A published port of a service on the ingress network.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct PortConfig {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "Protocol", tag = "2")]
    pub protocol: i32,
    #[prost(uint32, tag = "3")]
    pub target_port: u32,
    #[prost(uint32, tag = "4")]
    pub published_port: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Protocol {
    Tcp = 0,
    Udp = 1,
}

/// A single (table, network, key) entry with its value at event time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub table: String,
    pub network_id: String,
    pub key: String,
    pub value: Vec<u8>,
}

/// A change notification produced by the table store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvent {
    Create(TableEntry),
    Delete(TableEntry),
    Update(TableEntry),
}

impl TableEvent {
    pub fn entry(&self) -> &TableEntry {
        match self {
            TableEvent::Create(e) | TableEvent::Delete(e) | TableEvent::Update(e) => e,
        }
    }
}
