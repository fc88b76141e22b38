//! Cluster agent for multi-host container networking.
//!
//! A node running the agent joins a gossip-replicated table store,
//! publishes its endpoints and driver state into it and turns remote
//! changes into driver notifications, service bindings and DNS name
//! records.

pub mod agent;
pub mod config;
pub mod controller;
mod dispatch;
pub mod dns_server;
pub mod driver;
pub mod error;
pub mod network;
pub mod networkdb;
pub mod resolve;
pub mod service;
pub mod types;

pub use agent::Agent;
pub use controller::{ClusterOptions, Controller};
pub use error::{Error, Result};
pub use network::{Endpoint, JoinInfo, Network, Scope};
pub use networkdb::{NetworkDb, NetworkDbConfig, StoreError, TableStore, WatchHandle};
pub use types::{EndpointRecord, TableEntry, TableEvent, ENDPOINT_TABLE};
