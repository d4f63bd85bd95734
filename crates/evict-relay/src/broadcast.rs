//! Fan-out of relayed eviction frames.

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::error::Disconnect;
use crate::peer::PeerKey;
use crate::state::RelayState;

/// One eviction frame on its way to every peer but its origin.
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Relay-wide sequence number.
    pub sequence: u64,
    /// Peer the frame arrived from.
    pub origin: PeerKey,
    /// The complete frame, header included, exactly as received.
    pub frame: Bytes,
}

/// Queue `broadcast` on every peer except its origin.
///
/// Never waits on a peer: a full or closed queue disconnects that peer and
/// delivery to the rest continues. Returns the number of peers reached.
pub fn fan_out(state: &RelayState, broadcast: &Broadcast) -> usize {
    let recipients = state.peers().recipients(broadcast.origin);
    info!(
        sequence = broadcast.sequence,
        bytes = broadcast.frame.len(),
        peers = recipients.len(),
        "SENDING #{}",
        broadcast.sequence
    );

    let mut delivered = 0;
    for peer in recipients {
        match peer.outbound.try_send(broadcast.frame.clone()) {
            Ok(()) => {
                delivered += 1;
                debug!(sequence = broadcast.sequence, peer = %peer.key, "queued");
            }
            Err(TrySendError::Full(_)) => {
                warn!(sequence = broadcast.sequence, peer = %peer.key, "peer not keeping up");
                state.disconnect(peer.key, &Disconnect::SlowConsumer);
            }
            Err(TrySendError::Closed(_)) => {
                state.disconnect(peer.key, &Disconnect::QueueClosed);
            }
        }
    }
    delivered
}
