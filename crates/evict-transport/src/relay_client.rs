//! TCP client of a broadcast relay server.
//!
//! `init` connects, sends `Hello` carrying the node's alias and waits for a
//! zero-length `Welcome`. Afterwards a background task reads frames from the
//! relay while `send` writes `Evict` frames on the other half of the socket.
//! There is no reconnect: when the relay goes away the transport closes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use evict_proto::{FrameCodec, LocalIdentity, OpCode, HEADER_LEN, MAX_PAYLOAD_LEN};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Span};

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::handler::{Inbound, SharedHandler};
use crate::lifecycle::{require_active, write_frame, TaskSet};
use crate::transport::{
    check_payload, BoxFuture, ClusterTransport, StatsCounters, TransportKind, TransportStats,
};

struct RelayLink {
    writer: OwnedWriteHalf,
    tasks: TaskSet,
}

/// Relay client transport.
pub struct RelayClientTransport {
    config: TransportConfig,
    codec: FrameCodec,
    stats: Arc<StatsCounters>,
    closed: Arc<AtomicBool>,
    stop: CancellationToken,
    link: Mutex<Option<RelayLink>>,
}

impl RelayClientTransport {
    /// Creates an unconnected transport with a fresh identity.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let max = config
            .effective_max_message_size()
            .unwrap_or(MAX_PAYLOAD_LEN);
        Self {
            codec: FrameCodec::new(LocalIdentity::generate()).with_max_payload(max),
            config,
            stats: Arc::new(StatsCounters::default()),
            closed: Arc::new(AtomicBool::new(false)),
            stop: CancellationToken::new(),
            link: Mutex::new(None),
        }
    }

    async fn start(&self, handler: SharedHandler, log: Span) -> TransportResult<()> {
        let mut link = self.link.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if link.is_some() {
            return Err(TransportError::Configuration(
                "transport already initialized".to_string(),
            ));
        }

        let target = self.config.endpoint()?.socket_target();
        let alias = self.config.relay_alias();
        let connected = tokio::time::timeout(
            self.config.handshake_timeout(),
            connect_and_greet(&self.codec, &target, alias),
        )
        .await
        .unwrap_or_else(|_| Err(TransportError::Handshake(format!("{target} timed out"))));

        let (stream, relay) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                // a failed handshake leaves the transport closed
                self.closed.store(true, Ordering::Release);
                return Err(e);
            }
        };

        let span = info_span!(
            parent: &log,
            "transport",
            kind = %TransportKind::Relay,
            identity = %self.codec.local_identity(),
            relay = %relay
        );
        let (reader, writer) = stream.into_split();
        let tasks = TaskSet::new(span);
        tasks.spawn(receive_loop(
            reader,
            self.codec.clone(),
            Inbound::new(handler, Arc::clone(&self.stats)),
            Arc::clone(&self.closed),
            tasks.token(),
        ));
        info!(parent: tasks.span(), alias, "welcomed by relay");

        *link = Some(RelayLink { writer, tasks });
        Ok(())
    }

    async fn publish(&self, payload: Bytes) -> TransportResult<()> {
        check_payload(payload.len(), self.max_message_size())?;
        let mut guard = self.link.lock().await;
        let link = require_active(guard.as_mut(), &self.closed)?;

        let frame = self.codec.encode(&payload, OpCode::Evict)?;
        debug!(parent: link.tasks.span(), bytes = frame.len(), "sending eviction");
        let written = write_frame(
            &mut link.writer,
            &frame,
            self.config.send_timeout(),
            &self.stop,
        )
        .await;
        if let Err(e) = written {
            // a partial frame desynchronizes the relay, so the link is done
            self.closed.store(true, Ordering::Release);
            return Err(e);
        }
        self.stats.record_sent();
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop.cancel();
        let link = self.link.lock().await.take();
        if let Some(mut link) = link {
            match tokio::time::timeout(self.config.close_timeout(), link.writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(parent: link.tasks.span(), error = %e, "socket already shut down");
                }
                Err(_) => debug!(parent: link.tasks.span(), "socket shutdown timed out"),
            }
            link.tasks.shutdown(self.config.close_timeout()).await;
            info!(parent: link.tasks.span(), "disconnected from relay");
        }
    }
}

impl ClusterTransport for RelayClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn local_identity(&self) -> LocalIdentity {
        *self.codec.local_identity()
    }

    fn max_message_size(&self) -> Option<usize> {
        Some(self.codec.max_payload())
    }

    fn init<'a>(&'a self, handler: SharedHandler, log: Span) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(self.start(handler, log))
    }

    fn send<'a>(&'a self, payload: Bytes) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(self.publish(payload))
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(self.shutdown())
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

/// Connects, sends `Hello` and waits for a bare `Welcome` header.
async fn connect_and_greet(
    codec: &FrameCodec,
    target: &str,
    alias: &str,
) -> TransportResult<(TcpStream, SocketAddr)> {
    let mut stream = TcpStream::connect(target)
        .await
        .map_err(|e| TransportError::Handshake(format!("cannot connect to {target}: {e}")))?;
    stream.set_nodelay(true)?;
    let relay = stream.peer_addr()?;

    let hello = codec.encode(alias.as_bytes(), OpCode::Hello)?;
    stream
        .write_all(&hello)
        .await
        .map_err(|e| TransportError::Handshake(format!("sending hello: {e}")))?;

    let mut buf = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::Handshake(format!("awaiting welcome: {e}")))?;
    let header = codec.decode_header(&buf)?;
    if header.opcode != OpCode::Welcome || header.payload_len != 0 {
        return Err(TransportError::Handshake(format!(
            "expected empty Welcome, got {} with {} bytes",
            header.opcode, header.payload_len
        )));
    }
    Ok((stream, relay))
}

async fn receive_loop(
    reader: OwnedReadHalf,
    codec: FrameCodec,
    inbound: Inbound,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(reader, codec);
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => inbound.frame(frame),
            Some(Err(e)) => {
                warn!(error = %e, "receiver got exception");
                break;
            }
            None => {
                info!("relay closed the connection");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
}
