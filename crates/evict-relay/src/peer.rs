//! Connected peers and the table that tracks them.
//!
//! The table is the only state shared between connections. Its lock is held
//! for the length of one table operation and never across socket I/O.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Frames queued for a peer's writer task.
pub type PeerSender = mpsc::Sender<Bytes>;

/// Receiving end of a peer's outbound queue.
pub type PeerReceiver = mpsc::Receiver<Bytes>;

/// Create an outbound queue for one peer.
#[must_use]
pub fn peer_channel(depth: usize) -> (PeerSender, PeerReceiver) {
    mpsc::channel(depth.max(1))
}

/// Identifies a connection for the lifetime of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(u64);

impl PeerKey {
    /// Wrap a raw key.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw key.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What fan-out needs to reach a peer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Connection key.
    pub key: PeerKey,
    /// Remote socket address.
    pub addr: SocketAddr,
    /// Outbound frame queue.
    pub outbound: PeerSender,
    /// Cancels the peer's reader and writer tasks.
    pub cancel: CancellationToken,
}

/// A live connection as recorded in the table.
#[derive(Debug)]
pub struct Peer {
    handle: PeerHandle,
    alias: String,
    evictions: u64,
    connected_at: DateTime<Utc>,
}

impl Peer {
    /// Record a freshly accepted connection. Its alias is the remote address
    /// until it says `Hello`.
    #[must_use]
    pub fn new(handle: PeerHandle) -> Self {
        Self {
            alias: handle.addr.to_string(),
            handle,
            evictions: 0,
            connected_at: Utc::now(),
        }
    }

    /// Handle used to queue frames for this peer.
    #[must_use]
    pub const fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// Display alias.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Evictions this peer has sent through the relay.
    #[must_use]
    pub const fn evictions(&self) -> u64 {
        self.evictions
    }

    fn summary(&self) -> PeerSummary {
        PeerSummary {
            key: self.handle.key,
            alias: self.alias.clone(),
            evictions: self.evictions,
            connected_at: self.connected_at,
        }
    }
}

/// Point-in-time view of one peer, used for the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    /// Connection key.
    pub key: PeerKey,
    /// Display alias.
    pub alias: String,
    /// Evictions sent so far.
    pub evictions: u64,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
}

impl fmt::Display for PeerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} evictions since {}",
            self.key,
            self.alias,
            self.evictions,
            self.connected_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// All connected peers.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<PeerKey, Peer>>,
}

impl PeerTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer.
    pub fn insert(&self, peer: Peer) {
        self.peers.lock().insert(peer.handle.key, peer);
    }

    /// Remove a peer, returning it if it was still present.
    pub fn remove(&self, key: PeerKey) -> Option<Peer> {
        self.peers.lock().remove(&key)
    }

    /// Number of connected peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Whether no peer is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Set a peer's alias to `"<name> (<addr>)"` and return it.
    pub fn set_alias(&self, key: PeerKey, name: &str) -> Option<String> {
        let mut peers = self.peers.lock();
        let peer = peers.get_mut(&key)?;
        peer.alias = format!("{name} ({})", peer.handle.addr);
        Some(peer.alias.clone())
    }

    /// Current alias of a peer.
    #[must_use]
    pub fn alias(&self, key: PeerKey) -> Option<String> {
        self.peers.lock().get(&key).map(|p| p.alias.clone())
    }

    /// Handle of a single peer.
    #[must_use]
    pub fn handle(&self, key: PeerKey) -> Option<PeerHandle> {
        self.peers.lock().get(&key).map(|p| p.handle.clone())
    }

    /// Bump a peer's eviction counter, returning the new count.
    pub fn record_eviction(&self, key: PeerKey) -> Option<u64> {
        let mut peers = self.peers.lock();
        let peer = peers.get_mut(&key)?;
        peer.evictions += 1;
        Some(peer.evictions)
    }

    /// Handles of every peer except `origin`.
    #[must_use]
    pub fn recipients(&self, origin: PeerKey) -> Vec<PeerHandle> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.handle.key != origin)
            .map(|p| p.handle.clone())
            .collect()
    }

    /// Keys of every connected peer.
    #[must_use]
    pub fn keys(&self) -> Vec<PeerKey> {
        self.peers.lock().keys().copied().collect()
    }

    /// Summaries of every peer, oldest connection first.
    #[must_use]
    pub fn report(&self) -> Vec<PeerSummary> {
        let mut report: Vec<PeerSummary> = self.peers.lock().values().map(Peer::summary).collect();
        report.sort_by_key(|s| s.key);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(key: u64) -> (PeerHandle, PeerReceiver) {
        let (outbound, rx) = peer_channel(4);
        let handle = PeerHandle {
            key: PeerKey::new(key),
            addr: SocketAddr::from(([10, 0, 0, key as u8], 4000)),
            outbound,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    #[test]
    fn test_alias_defaults_to_address() {
        let (h, _rx) = handle(1);
        let peer = Peer::new(h);
        assert_eq!(peer.alias(), "10.0.0.1:4000");
        assert_eq!(peer.evictions(), 0);
    }

    #[test]
    fn test_set_alias_includes_address() {
        let table = PeerTable::new();
        let (h, _rx) = handle(2);
        table.insert(Peer::new(h));

        let alias = table.set_alias(PeerKey::new(2), "node-2");
        assert_eq!(alias.as_deref(), Some("node-2 (10.0.0.2:4000)"));
        assert_eq!(table.alias(PeerKey::new(2)), alias);
        assert!(table.set_alias(PeerKey::new(9), "ghost").is_none());
    }

    #[test]
    fn test_recipients_exclude_origin() {
        let table = PeerTable::new();
        let mut receivers = Vec::new();
        for key in 1..=3 {
            let (h, rx) = handle(key);
            table.insert(Peer::new(h));
            receivers.push(rx);
        }

        let mut keys: Vec<u64> = table
            .recipients(PeerKey::new(1))
            .iter()
            .map(|h| h.key.get())
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![2, 3]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = PeerTable::new();
        let (h, _rx) = handle(1);
        table.insert(Peer::new(h));

        assert!(table.remove(PeerKey::new(1)).is_some());
        assert!(table.remove(PeerKey::new(1)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_report_counts_evictions() {
        let table = PeerTable::new();
        let (h1, _rx1) = handle(1);
        let (h2, _rx2) = handle(2);
        table.insert(Peer::new(h2));
        table.insert(Peer::new(h1));

        assert_eq!(table.record_eviction(PeerKey::new(2)), Some(1));
        assert_eq!(table.record_eviction(PeerKey::new(2)), Some(2));
        assert_eq!(table.record_eviction(PeerKey::new(7)), None);

        let report = table.report();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].key, PeerKey::new(1));
        assert_eq!(report[1].evictions, 2);
        assert!(report[1].to_string().starts_with("#2 10.0.0.2:4000: 2 evictions since "));
    }
}
