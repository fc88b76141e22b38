//! Gossip transport between table store replicas.
//!
//! Messages travel as newline-delimited JSON over TCP. Each line is
//! `<hex sha256(secret || body)> <body>` so nodes sharing the cluster
//! secret reject traffic from anyone else. A single sender task owns one
//! connection per peer, which keeps messages to a peer in send order.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use super::{Inner, StoreError};
use crate::types::TableEntry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum GossipMessage {
    /// A node asks to be part of the cluster.
    Join { node: String, addr: SocketAddr },
    /// Reply to a join with every node the responder knows.
    Members { nodes: Vec<(String, SocketAddr)> },
    /// A node participates in a network and wants its current entries.
    NetworkJoin { node: String, network_id: String },
    NetworkLeave { node: String, network_id: String },
    Entry(EntryOp),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EntryOp {
    pub owner: String,
    pub ltime: u64,
    pub deleting: bool,
    pub entry: TableEntry,
}

pub(crate) struct Outbound {
    pub addr: SocketAddr,
    pub message: GossipMessage,
    pub ack: Option<oneshot::Sender<io::Result<()>>>,
}

fn digest(secret: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn encode_line(secret: &str, message: &GossipMessage) -> Result<String, StoreError> {
    let body = serde_json::to_string(message).map_err(|e| StoreError::Malformed(e.to_string()))?;
    Ok(format!("{} {}\n", digest(secret, &body), body))
}

pub(crate) fn decode_line(secret: &str, line: &str) -> Result<GossipMessage, StoreError> {
    let (sig, body) = line
        .split_once(' ')
        .ok_or_else(|| StoreError::Malformed("missing digest".into()))?;
    if sig != digest(secret, body) {
        return Err(StoreError::Malformed("digest mismatch".into()));
    }
    serde_json::from_str(body).map_err(|e| StoreError::Malformed(e.to_string()))
}

/// Drain the outbound queue, writing each message to its peer.
pub(crate) async fn send_loop(mut rx: mpsc::UnboundedReceiver<Outbound>, secret: String) {
    let mut conns: HashMap<SocketAddr, TcpStream> = HashMap::new();

    while let Some(out) = rx.recv().await {
        let result = match encode_line(&secret, &out.message) {
            Ok(line) => send_line(&mut conns, out.addr, line.as_bytes()).await,
            Err(e) => {
                error!("Failed to serialize gossip message: {}", e);
                Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            }
        };

        if let Err(e) = &result {
            warn!("Failed to send gossip message to {}: {}", out.addr, e);
        }
        if let Some(ack) = out.ack {
            let _ = ack.send(result);
        }
    }
    debug!("Gossip outbound channel closed, shutting down sender");
}

async fn send_line(
    conns: &mut HashMap<SocketAddr, TcpStream>,
    addr: SocketAddr,
    line: &[u8],
) -> io::Result<()> {
    if let Some(stream) = conns.get_mut(&addr) {
        if stream.write_all(line).await.is_ok() {
            return Ok(());
        }
        conns.remove(&addr);
    }

    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.write_all(line).await?;
    conns.insert(addr, stream);
    Ok(())
}

/// Accept peer connections until the store goes away.
pub(crate) async fn accept_loop(listener: TcpListener, inner: Weak<Inner>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if inner.strong_count() == 0 {
                    break;
                }
                debug!("Accepted gossip connection from {}", peer);
                tokio::spawn(read_loop(stream, peer, inner.clone()));
            }
            Err(e) => {
                warn!("Failed to accept gossip connection: {}", e);
            }
        }
    }
}

async fn read_loop(stream: TcpStream, peer: SocketAddr, inner: Weak<Inner>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("Gossip connection from {} failed: {}", peer, e);
                break;
            }
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        match decode_line(&inner.secret, &line) {
            Ok(message) => inner.handle_message(message),
            Err(e) => warn!("Dropping gossip message from {}: {}", peer, e),
        }
    }
    debug!("Gossip connection from {} closed", peer);
}
