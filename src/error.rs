//! Error types for the agent.

use thiserror::Error;

use crate::networkdb::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to find interface {0}")]
    InterfaceNotFound(String),

    #[error("failed to get interface addresses: {0}")]
    InterfaceAddrs(#[source] nix::Error),

    #[error("failed to get bind address for interface {0}")]
    NoBindAddress(String),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("cluster agent is already running")]
    AgentRunning,

    #[error("network {0} not found")]
    NetworkNotFound(String),

    #[error("driver for network type {0} is not loaded")]
    DriverNotLoaded(String),

    #[error("service {service_id} is bound as {existing}, cannot bind as {requested}")]
    ServiceConflict {
        service_id: String,
        existing: String,
        requested: String,
    },

    #[error("failed to decode endpoint record: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid endpoint record for {0}: missing name or address")]
    InvalidEndpointRecord(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
