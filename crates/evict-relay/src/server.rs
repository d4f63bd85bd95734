//! Accept loop and per-peer reader and writer tasks.
//!
//! Every accepted connection gets two tasks. The reader waits for a 20-byte
//! header, reads the payload behind it and acts on the opcode. Eviction
//! frames are fanned out from the reader itself; queueing never blocks, so
//! frames from one sender reach every recipient in the order they were read.
//! The writer drains the peer's outbound queue onto the socket. Any failure
//! disconnects that peer and nobody else.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use evict_proto::{FrameHeader, OpCode, HEADER_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{fan_out, Broadcast};
use crate::config::RelayConfig;
use crate::error::{Disconnect, RelayError, RelayResult};
use crate::peer::{peer_channel, Peer, PeerHandle, PeerKey, PeerReceiver};
use crate::state::RelayState;

/// The broadcast relay server.
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BindFailed`] if the address cannot be bound.
    pub async fn bind(config: RelayConfig) -> RelayResult<Self> {
        let addr = config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::BindFailed(addr, e))?;

        Ok(Self {
            listener,
            state: Arc::new(RelayState::new(config)?),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the relay is listening on.
    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared relay state.
    #[must_use]
    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Token that stops [`serve`](Self::serve) when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept peers until the shutdown token is cancelled, then disconnect
    /// everyone.
    pub async fn serve(self) -> RelayResult<()> {
        info!(addr = %self.local_addr()?, "relay listening");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => self.handle_connection(stream, peer_addr),
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }
            }
        }

        for key in self.state.peers().keys() {
            self.state.disconnect(key, &Disconnect::Shutdown);
        }
        info!(broadcasts = self.state.broadcasts(), "relay stopped");
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
        }

        let key = self.state.next_key();
        let cancel = self.shutdown.child_token();
        let (outbound, rx) = peer_channel(self.state.config().outbound_queue_depth);
        let (reader, writer) = stream.into_split();

        self.state.peers().insert(Peer::new(PeerHandle {
            key,
            addr: peer_addr,
            outbound,
            cancel: cancel.clone(),
        }));
        info!(
            peer = %peer_addr,
            key = %key,
            peers = self.state.peers().len(),
            "ACCEPTED"
        );

        tokio::spawn(write_loop(
            Arc::clone(&self.state),
            key,
            writer,
            rx,
            cancel.clone(),
        ));
        tokio::spawn(read_loop(Arc::clone(&self.state), key, reader, cancel));
    }
}

async fn read_loop(
    state: Arc<RelayState>,
    key: PeerKey,
    mut reader: OwnedReadHalf,
    cancel: CancellationToken,
) {
    let reason = tokio::select! {
        () = cancel.cancelled() => return,
        reason = serve_peer(&state, key, &mut reader) => reason,
    };
    state.disconnect(key, &reason);
}

async fn serve_peer(state: &Arc<RelayState>, key: PeerKey, reader: &mut OwnedReadHalf) -> Disconnect {
    loop {
        if let Err(reason) = relay_next_frame(state, key, reader).await {
            return reason;
        }
    }
}

async fn relay_next_frame(
    state: &Arc<RelayState>,
    key: PeerKey,
    reader: &mut OwnedReadHalf,
) -> Result<(), Disconnect> {
    let config = state.config();

    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(closed_or_io)?;
    let decoded = FrameHeader::decode(&header, state.identity())?;

    let len = decoded.payload_len;
    if !config.is_message_size_valid(len) {
        return Err(Disconnect::Oversized {
            len,
            limit: config.max_message_size,
        });
    }

    let mut frame = BytesMut::with_capacity(decoded.frame_len());
    frame.extend_from_slice(&header);
    frame.resize(decoded.frame_len(), 0);
    if len > 0 {
        tokio::time::timeout(config.payload_timeout, reader.read_exact(&mut frame[HEADER_LEN..]))
            .await
            .map_err(|_| Disconnect::PayloadTimeout {
                len,
                timeout_ms: u64::try_from(config.payload_timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(|e| truncated_or_io(e, len))?;
    }
    let frame = frame.freeze();

    match decoded.opcode {
        OpCode::Evict if len > 0 => {
            let evictions = state.peers().record_eviction(key).unwrap_or_default();
            let sequence = state.next_sequence();
            info!(
                sequence,
                peer = %peer_label(state, key),
                bytes = len,
                evictions,
                "RECEIVED #{sequence}"
            );
            fan_out(
                state,
                &Broadcast {
                    sequence,
                    origin: key,
                    frame,
                },
            );
        }
        OpCode::Hello => {
            let name = String::from_utf8_lossy(&frame[HEADER_LEN..]);
            let alias = state.peers().set_alias(key, &name).unwrap_or_default();
            info!(peer = %alias, "HELLO");

            let peer = state.peers().handle(key).ok_or(Disconnect::QueueClosed)?;
            peer.outbound
                .try_send(state.welcome_frame())
                .map_err(|e| match e {
                    TrySendError::Full(_) => Disconnect::SlowConsumer,
                    TrySendError::Closed(_) => Disconnect::QueueClosed,
                })?;
        }
        other => {
            info!(peer = %peer_label(state, key), "RECEIVED {other} / {len}");
        }
    }
    Ok(())
}

async fn write_loop(
    state: Arc<RelayState>,
    key: PeerKey,
    mut writer: OwnedWriteHalf,
    mut outbound: PeerReceiver,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };

        let written = tokio::select! {
            () = cancel.cancelled() => break,
            written = writer.write_all(&frame) => written,
        };
        if let Err(e) = written {
            state.disconnect(key, &Disconnect::Io(e));
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(key = %key, error = %e, "socket shutdown failed");
    }
}

fn peer_label(state: &RelayState, key: PeerKey) -> String {
    state.peers().alias(key).unwrap_or_else(|| key.to_string())
}

fn closed_or_io(e: io::Error) -> Disconnect {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Disconnect::Closed
    } else {
        Disconnect::Io(e)
    }
}

fn truncated_or_io(e: io::Error, len: usize) -> Disconnect {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Disconnect::Truncated { len }
    } else {
        Disconnect::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_config() -> RelayConfig {
        RelayConfig::new("127.0.0.1:0".parse().unwrap())
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let server = RelayServer::bind(local_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.state().peers().is_empty());
    }

    #[tokio::test]
    async fn test_bind_fails_on_used_port() {
        let first = RelayServer::bind(local_config()).await.unwrap();
        let addr = first.local_addr().unwrap();

        let err = RelayServer::bind(RelayConfig::new(addr)).await.err().unwrap();
        assert!(matches!(err, RelayError::BindFailed(a, _) if a == addr));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = RelayServer::bind(local_config()).await.unwrap();
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(server.serve());

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_eof_maps_to_disconnect_reason() {
        let eof = || io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(closed_or_io(eof()), Disconnect::Closed));
        assert!(matches!(truncated_or_io(eof(), 10), Disconnect::Truncated { len: 10 }));
        assert!(matches!(
            closed_or_io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Disconnect::Io(_)
        ));
    }
}
