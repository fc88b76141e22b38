//! The capabilities the agent needs from a network driver.

use crate::error::Result;

/// Kind of change delivered to [`Driver::event_notify`]. Store updates
/// reach drivers as [`EventKind::Delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Delete,
}

/// Discovery facts pushed to drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A cluster node became known. `self_node` marks the local node's
    /// own address.
    Node { address: String, self_node: bool },
}

pub trait Driver: Send + Sync {
    fn network_type(&self) -> &str;

    fn discover_new(&self, event: &DiscoveryEvent) -> Result<()>;

    /// Called for every change in a driver table the driver watches.
    fn event_notify(&self, kind: EventKind, network_id: &str, table: &str, key: &str, value: &[u8]);
}
