//! State owned by one relay server instance.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use evict_proto::{encode_frame, LocalIdentity, OpCode};
use tracing::info;

use crate::config::RelayConfig;
use crate::error::{Disconnect, RelayResult};
use crate::peer::{PeerKey, PeerSummary, PeerTable};

/// Peers, counters and the relay's own identity.
///
/// Created when the server binds and dropped with it; nothing here is global.
#[derive(Debug)]
pub struct RelayState {
    config: RelayConfig,
    identity: LocalIdentity,
    welcome: Bytes,
    peers: PeerTable,
    next_key: AtomicU64,
    sequence: AtomicU64,
}

impl RelayState {
    /// Create state for a relay with a fresh identity.
    pub fn new(config: RelayConfig) -> RelayResult<Self> {
        let identity = LocalIdentity::generate();
        let welcome = encode_frame(&identity, OpCode::Welcome, &[])?;
        Ok(Self {
            config,
            identity,
            welcome,
            peers: PeerTable::new(),
            next_key: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        })
    }

    /// Relay configuration.
    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Identity stamped on frames the relay originates.
    #[must_use]
    pub const fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// The zero-length `Welcome` frame sent in reply to `Hello`.
    #[must_use]
    pub fn welcome_frame(&self) -> Bytes {
        self.welcome.clone()
    }

    /// Connected peers.
    #[must_use]
    pub const fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Allocate a key for a new connection.
    pub fn next_key(&self) -> PeerKey {
        PeerKey::new(self.next_key.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Allocate the sequence number of the next broadcast.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Broadcasts relayed so far.
    #[must_use]
    pub fn broadcasts(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Snapshot of every connected peer.
    #[must_use]
    pub fn report(&self) -> Vec<PeerSummary> {
        self.peers.report()
    }

    /// Drop a peer and stop its tasks. Safe to call from any path, any number
    /// of times; only the first call logs.
    pub fn disconnect(&self, key: PeerKey, reason: &Disconnect) {
        let Some(peer) = self.peers.remove(key) else {
            return;
        };
        peer.handle().cancel.cancel();
        info!(
            peer = %peer.alias(),
            evictions = peer.evictions(),
            reason = %reason,
            remaining = self.peers.len(),
            "DISCONNECTED"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{peer_channel, Peer, PeerHandle};
    use evict_proto::{FrameHeader, HEADER_LEN};
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_welcome_frame_is_header_only() {
        let state = RelayState::new(RelayConfig::default()).unwrap();
        let frame = state.welcome_frame();
        assert_eq!(frame.len(), HEADER_LEN);

        let other = LocalIdentity::generate();
        let header = FrameHeader::decode(&frame, &other).unwrap();
        assert_eq!(header.opcode, OpCode::Welcome);
        assert_eq!(header.payload_len, 0);
        assert_eq!(&header.sender, state.identity());
    }

    #[test]
    fn test_keys_and_sequences_increase() {
        let state = RelayState::new(RelayConfig::default()).unwrap();
        assert_eq!(state.next_key(), PeerKey::new(1));
        assert_eq!(state.next_key(), PeerKey::new(2));
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.next_sequence(), 2);
        assert_eq!(state.broadcasts(), 2);
    }

    #[test]
    fn test_disconnect_cancels_once() {
        let state = RelayState::new(RelayConfig::default()).unwrap();
        let (outbound, _rx) = peer_channel(1);
        let cancel = CancellationToken::new();
        let key = state.next_key();
        state.peers().insert(Peer::new(PeerHandle {
            key,
            addr: "127.0.0.1:5000".parse().unwrap(),
            outbound,
            cancel: cancel.clone(),
        }));

        state.disconnect(key, &Disconnect::Closed);
        assert!(cancel.is_cancelled());
        assert!(state.peers().is_empty());
        state.disconnect(key, &Disconnect::Closed);
    }
}
