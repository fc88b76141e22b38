//! Gossip-replicated table store.
//!
//! Entries are addressed by (table, network, key). Every node keeps a
//! full replica of the networks it has joined; local mutations are
//! applied immediately and gossiped to peers, remote mutations arrive
//! through the [`gossip`] transport. Watchers receive [`TableEvent`]s
//! for both.

mod gossip;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::types::{TableEntry, TableEvent};
use gossip::{EntryOp, GossipMessage, Outbound};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table store is closed")]
    Closed,

    #[error("entry {key} already exists in table {table} for network {network_id}")]
    EntryExists {
        table: String,
        network_id: String,
        key: String,
    },

    #[error("entry {key} does not exist in table {table} for network {network_id}")]
    EntryNotFound {
        table: String,
        network_id: String,
        key: String,
    },

    #[error("network {0} has not been joined")]
    NetworkNotJoined(String),

    #[error("invalid peer address {0}")]
    InvalidPeerAddress(String),

    #[error("failed to join any of {0:?}")]
    JoinFailed(Vec<String>),

    #[error("malformed gossip message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cancels a watch registered with [`TableStore::watch`].
///
/// Cancelling consumes the handle and closes the watch channel, which is
/// the only signal a dispatch loop gets to stop.
pub struct WatchHandle {
    cancel: Box<dyn FnOnce() + Send + Sync>,
}

impl WatchHandle {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn cancel(self) {
        (self.cancel)()
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").finish_non_exhaustive()
    }
}

/// The table store capabilities the agent relies on.
///
/// An empty `network_id` or `key` passed to [`TableStore::watch`] means
/// "all networks" / "all keys".
#[async_trait]
pub trait TableStore: Send + Sync + 'static {
    async fn join(&self, members: &[String]) -> Result<(), StoreError>;

    async fn join_network(&self, network_id: &str) -> Result<(), StoreError>;

    async fn leave_network(&self, network_id: &str) -> Result<(), StoreError>;

    async fn create_entry(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError>;

    async fn delete_entry(&self, table: &str, network_id: &str, key: &str)
        -> Result<(), StoreError>;

    fn watch(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
    ) -> (mpsc::UnboundedReceiver<TableEvent>, WatchHandle);

    /// Visit every entry of `table` as (network id, key, value). The
    /// visitor returns `true` to stop early.
    fn walk_table(&self, table: &str, visit: &mut dyn FnMut(&str, &str, &[u8]) -> bool);

    async fn close(&self);
}

#[derive(Debug, Clone)]
pub struct NetworkDbConfig {
    pub bind_addr: IpAddr,
    /// Gossip port; 0 picks an ephemeral port.
    pub bind_port: u16,
    pub node_name: String,
    pub cluster_secret: String,
}

type EntryKey = (String, String, String);

#[derive(Debug, Clone)]
struct Entry {
    owner: String,
    ltime: u64,
    value: Vec<u8>,
}

struct Watcher {
    id: u64,
    table: String,
    network_id: String,
    key: String,
    tx: mpsc::UnboundedSender<TableEvent>,
}

impl Watcher {
    fn matches(&self, entry: &TableEntry) -> bool {
        self.table == entry.table
            && (self.network_id.is_empty() || self.network_id == entry.network_id)
            && (self.key.is_empty() || self.key == entry.key)
    }
}

#[derive(Default)]
struct State {
    closed: bool,
    clock: u64,
    entries: BTreeMap<EntryKey, Entry>,
    networks: HashSet<String>,
    peers: HashMap<String, SocketAddr>,
    watchers: Vec<Watcher>,
    next_watch_id: u64,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn notify(&self, event: TableEvent) {
        let entry = event.entry();
        for w in self.watchers.iter().filter(|w| w.matches(entry)) {
            // A receiver dropped without cancelling only loses its own events.
            let _ = w.tx.send(event.clone());
        }
    }
}

fn table_entry(key: &EntryKey, value: Vec<u8>) -> TableEntry {
    TableEntry {
        table: key.0.clone(),
        network_id: key.1.clone(),
        key: key.2.clone(),
        value,
    }
}

pub(crate) struct Inner {
    node_name: String,
    advertise_addr: SocketAddr,
    default_port: u16,
    secret: String,
    state: Mutex<State>,
    outbound: mpsc::UnboundedSender<Outbound>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// In-process replica of the cluster tables with gossip replication.
pub struct NetworkDb {
    inner: Arc<Inner>,
}

impl NetworkDb {
    /// Bind the gossip listener and start the transport tasks.
    pub async fn new(config: NetworkDbConfig) -> Result<Self, StoreError> {
        let listener = TcpListener::bind((config.bind_addr, config.bind_port)).await?;
        let advertise_addr = listener.local_addr()?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            node_name: config.node_name,
            advertise_addr,
            default_port: config.bind_port,
            secret: config.cluster_secret,
            state: Mutex::new(State::default()),
            outbound,
            tasks: Mutex::new(Vec::new()),
        });

        let sender = tokio::spawn(gossip::send_loop(outbound_rx, inner.secret.clone()));
        let acceptor = tokio::spawn(gossip::accept_loop(listener, Arc::downgrade(&inner)));
        inner.tasks.lock().extend([sender, acceptor]);

        info!(
            "Table store for node {} listening on {}",
            inner.node_name, advertise_addr
        );
        Ok(Self { inner })
    }

    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }

    /// Address peers use to reach this node.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.advertise_addr
    }

    /// Names of the peers currently known to this node.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.state.lock().peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_network_joined(&self, network_id: &str) -> bool {
        self.inner.state.lock().networks.contains(network_id)
    }

    async fn resolve_member(&self, member: &str) -> Result<SocketAddr, StoreError> {
        if let Ok(addr) = member.parse::<SocketAddr>() {
            return Ok(addr);
        }
        if let Ok(ip) = member.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.inner.default_port));
        }

        let resolved: Vec<SocketAddr> = if member.contains(':') {
            tokio::net::lookup_host(member).await.map(|a| a.collect())
        } else {
            tokio::net::lookup_host((member, self.inner.default_port))
                .await
                .map(|a| a.collect())
        }
        .unwrap_or_default();
        resolved
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidPeerAddress(member.to_string()))
    }
}

#[async_trait]
impl TableStore for NetworkDb {
    async fn join(&self, members: &[String]) -> Result<(), StoreError> {
        if self.inner.state.lock().closed {
            return Err(StoreError::Closed);
        }

        let mut joined = 0;
        for member in members {
            let addr = match self.resolve_member(member).await {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Skipping cluster member {}: {}", member, e);
                    continue;
                }
            };

            let (ack_tx, ack_rx) = oneshot::channel();
            let message = GossipMessage::Join {
                node: self.inner.node_name.clone(),
                addr: self.inner.advertise_addr,
            };
            self.inner.send(addr, message, Some(ack_tx));

            match ack_rx.await {
                Ok(Ok(())) => {
                    info!("Sent join request to {}", addr);
                    joined += 1;
                }
                Ok(Err(e)) => warn!("Failed to join {}: {}", addr, e),
                Err(_) => return Err(StoreError::Closed),
            }
        }

        if joined == 0 {
            return Err(StoreError::JoinFailed(members.to_vec()));
        }
        Ok(())
    }

    async fn join_network(&self, network_id: &str) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }

        if state.networks.insert(network_id.to_string()) {
            debug!("Node {} joined network {}", self.inner.node_name, network_id);
        }
        let message = GossipMessage::NetworkJoin {
            node: self.inner.node_name.clone(),
            network_id: network_id.to_string(),
        };
        self.inner.broadcast(&state, message);
        Ok(())
    }

    async fn leave_network(&self, network_id: &str) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }
        if !state.networks.remove(network_id) {
            return Err(StoreError::NetworkNotJoined(network_id.to_string()));
        }

        let keys: Vec<EntryKey> = state
            .entries
            .keys()
            .filter(|k| k.1 == network_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = state.entries.remove(&key) {
                state.notify(TableEvent::Delete(table_entry(&key, entry.value)));
            }
        }

        let message = GossipMessage::NetworkLeave {
            node: self.inner.node_name.clone(),
            network_id: network_id.to_string(),
        };
        self.inner.broadcast(&state, message);
        debug!("Node {} left network {}", self.inner.node_name, network_id);
        Ok(())
    }

    async fn create_entry(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }

        let entry_key = (table.to_string(), network_id.to_string(), key.to_string());
        if state.entries.contains_key(&entry_key) {
            return Err(StoreError::EntryExists {
                table: table.to_string(),
                network_id: network_id.to_string(),
                key: key.to_string(),
            });
        }

        let ltime = state.tick();
        state.entries.insert(
            entry_key.clone(),
            Entry {
                owner: self.inner.node_name.clone(),
                ltime,
                value: value.clone(),
            },
        );

        let entry = table_entry(&entry_key, value);
        state.notify(TableEvent::Create(entry.clone()));
        self.inner.broadcast(
            &state,
            GossipMessage::Entry(EntryOp {
                owner: self.inner.node_name.clone(),
                ltime,
                deleting: false,
                entry,
            }),
        );
        Ok(())
    }

    async fn delete_entry(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(StoreError::Closed);
        }

        let entry_key = (table.to_string(), network_id.to_string(), key.to_string());
        let Some(removed) = state.entries.remove(&entry_key) else {
            return Err(StoreError::EntryNotFound {
                table: table.to_string(),
                network_id: network_id.to_string(),
                key: key.to_string(),
            });
        };

        let ltime = state.tick();
        let entry = table_entry(&entry_key, removed.value);
        state.notify(TableEvent::Delete(entry.clone()));
        self.inner.broadcast(
            &state,
            GossipMessage::Entry(EntryOp {
                owner: self.inner.node_name.clone(),
                ltime,
                deleting: true,
                entry,
            }),
        );
        Ok(())
    }

    fn watch(
        &self,
        table: &str,
        network_id: &str,
        key: &str,
    ) -> (mpsc::UnboundedReceiver<TableEvent>, WatchHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        if state.closed {
            // Dropping tx hands back an already-closed channel.
            return (rx, WatchHandle::new(|| {}));
        }

        let id = state.next_watch_id;
        state.next_watch_id += 1;
        state.watchers.push(Watcher {
            id,
            table: table.to_string(),
            network_id: network_id.to_string(),
            key: key.to_string(),
            tx,
        });

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = WatchHandle::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.state.lock().watchers.retain(|w| w.id != id);
            }
        });
        (rx, handle)
    }

    fn walk_table(&self, table: &str, visit: &mut dyn FnMut(&str, &str, &[u8]) -> bool) {
        // Snapshot first so visitors may call back into the store.
        let snapshot: Vec<(String, String, Vec<u8>)> = {
            let state = self.inner.state.lock();
            state
                .entries
                .iter()
                .filter(|(k, _)| k.0 == table)
                .map(|(k, e)| (k.1.clone(), k.2.clone(), e.value.clone()))
                .collect()
        };

        for (network_id, key, value) in &snapshot {
            if visit(network_id, key, value) {
                break;
            }
        }
    }

    async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.watchers.clear();
            state.peers.clear();
        }

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Table store for node {} closed", self.inner.node_name);
    }
}

impl Inner {
    fn send(&self, addr: SocketAddr, message: GossipMessage, ack: Option<oneshot::Sender<std::io::Result<()>>>) {
        if self.outbound.send(Outbound { addr, message, ack }).is_err() {
            debug!("Gossip sender stopped, dropping message to {}", addr);
        }
    }

    fn broadcast(&self, state: &State, message: GossipMessage) {
        for addr in state.peers.values() {
            self.send(*addr, message.clone(), None);
        }
    }

    /// Record a newly discovered peer and ask it for the entries of every
    /// network we participate in.
    fn add_peer(&self, state: &mut State, node: String, addr: SocketAddr) -> bool {
        if node == self.node_name || state.peers.contains_key(&node) {
            return false;
        }
        info!("Node {} discovered peer {} at {}", self.node_name, node, addr);
        state.peers.insert(node, addr);

        for network_id in &state.networks {
            let message = GossipMessage::NetworkJoin {
                node: self.node_name.clone(),
                network_id: network_id.clone(),
            };
            self.send(addr, message, None);
        }
        true
    }

    /// Apply a message received from a peer.
    fn handle_message(&self, message: GossipMessage) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        match message {
            GossipMessage::Join { node, addr } => {
                if node == self.node_name {
                    return;
                }
                let mut nodes: Vec<(String, SocketAddr)> = state
                    .peers
                    .iter()
                    .filter(|(name, _)| **name != node)
                    .map(|(name, a)| (name.clone(), *a))
                    .collect();
                nodes.push((self.node_name.clone(), self.advertise_addr));
                self.send(addr, GossipMessage::Members { nodes }, None);
                self.add_peer(&mut state, node, addr);
            }
            GossipMessage::Members { nodes } => {
                for (node, addr) in nodes {
                    if self.add_peer(&mut state, node, addr) {
                        let join = GossipMessage::Join {
                            node: self.node_name.clone(),
                            addr: self.advertise_addr,
                        };
                        self.send(addr, join, None);
                    }
                }
            }
            GossipMessage::NetworkJoin { node, network_id } => {
                let Some(addr) = state.peers.get(&node).copied() else {
                    debug!("Network join for {} from unknown node {}", network_id, node);
                    return;
                };
                if !state.networks.contains(&network_id) {
                    return;
                }
                for (key, entry) in state
                    .entries
                    .iter()
                    .filter(|(k, e)| k.1 == network_id && e.owner == self.node_name)
                {
                    let op = EntryOp {
                        owner: entry.owner.clone(),
                        ltime: entry.ltime,
                        deleting: false,
                        entry: table_entry(key, entry.value.clone()),
                    };
                    self.send(addr, GossipMessage::Entry(op), None);
                }
            }
            GossipMessage::NetworkLeave { node, network_id } => {
                let keys: Vec<EntryKey> = state
                    .entries
                    .iter()
                    .filter(|(k, e)| k.1 == network_id && e.owner == node)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in keys {
                    if let Some(entry) = state.entries.remove(&key) {
                        state.notify(TableEvent::Delete(table_entry(&key, entry.value)));
                    }
                }
            }
            GossipMessage::Entry(op) => self.apply_entry(&mut state, op),
        }
    }

    fn apply_entry(&self, state: &mut State, op: EntryOp) {
        if !state.networks.contains(&op.entry.network_id) {
            return;
        }
        state.clock = state.clock.max(op.ltime);

        let key = (
            op.entry.table.clone(),
            op.entry.network_id.clone(),
            op.entry.key.clone(),
        );
        if let Some(existing) = state.entries.get(&key) {
            if existing.ltime >= op.ltime {
                debug!("Ignoring stale entry {:?} at ltime {}", key, op.ltime);
                return;
            }
        }

        if op.deleting {
            if let Some(removed) = state.entries.remove(&key) {
                state.notify(TableEvent::Delete(table_entry(&key, removed.value)));
            }
            return;
        }

        let previous = state.entries.insert(
            key,
            Entry {
                owner: op.owner,
                ltime: op.ltime,
                value: op.entry.value.clone(),
            },
        );
        let event = match previous {
            Some(_) => TableEvent::Update(op.entry),
            None => TableEvent::Create(op.entry),
        };
        state.notify(event);
    }
}
