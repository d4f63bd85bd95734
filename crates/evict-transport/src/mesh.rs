//! Reliable group delivery over a TCP unicast mesh.
//!
//! Each member listens on its configured address and accepts one connection
//! per peer, reading frames on a task of its own. Outbound, the member keeps
//! one write-only link per configured peer, dialed on first use and re-dialed
//! after a failure. A send writes to every peer concurrently, so a dead or
//! stalled peer costs at most one timeout and never delays the others. An
//! accept failure closes the whole transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use evict_proto::{EndpointAddress, FrameCodec, LocalIdentity, OpCode, MAX_PAYLOAD_LEN};
use futures::future::join_all;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::handler::{Inbound, SharedHandler};
use crate::lifecycle::{require_active, write_frame, TaskSet};
use crate::transport::{
    check_payload, BoxFuture, ClusterTransport, StatsCounters, TransportKind, TransportStats,
};

struct MeshLinks {
    local_addr: SocketAddr,
    peers: Vec<EndpointAddress>,
    outbound: HashMap<String, TcpStream>,
    tasks: Arc<TaskSet>,
}

/// Reliable multicast transport backed by a TCP mesh.
pub struct MeshTransport {
    config: TransportConfig,
    codec: FrameCodec,
    stats: Arc<StatsCounters>,
    closed: Arc<AtomicBool>,
    stop: CancellationToken,
    links: Mutex<Option<MeshLinks>>,
}

impl MeshTransport {
    /// Creates an uninitialized transport with a fresh identity.
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
            links: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, once initialized.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.links.lock().await.as_ref().map(|l| l.local_addr)
    }

    async fn start(&self, handler: SharedHandler, log: Span) -> TransportResult<()> {
        let mut links = self.links.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if links.is_some() {
            return Err(TransportError::Configuration(
                "transport already initialized".to_string(),
            ));
        }

        let listen = self.config.endpoint()?;
        let peers = self.config.peer_endpoints()?;
        let listener = TcpListener::bind(listen.socket_target()).await?;
        let local_addr = listener.local_addr()?;

        let span = info_span!(
            parent: &log,
            "transport",
            kind = %TransportKind::ReliableMulticast,
            identity = %self.codec.local_identity(),
            listen = %local_addr
        );
        let tasks = Arc::new(TaskSet::new(span));
        tasks.spawn(accept_loop(
            listener,
            self.codec.clone(),
            Inbound::new(handler, Arc::clone(&self.stats)),
            Arc::clone(&tasks),
            Arc::clone(&self.closed),
        ));
        info!(parent: tasks.span(), peers = peers.len(), "mesh listening");

        *links = Some(MeshLinks {
            local_addr,
            peers,
            outbound: HashMap::new(),
            tasks,
        });
        Ok(())
    }

    async fn publish(&self, payload: Bytes) -> TransportResult<()> {
        check_payload(payload.len(), self.max_message_size())?;
        let mut guard = self.links.lock().await;
        let links = require_active(guard.as_mut(), &self.closed)?;
        let frame = self.codec.encode(&payload, OpCode::Evict)?;
        let timeouts = LinkTimeouts {
            dial: self.config.handshake_timeout(),
            write: self.config.send_timeout(),
        };

        let mut writes = Vec::with_capacity(links.peers.len());
        for peer in &links.peers {
            let key = peer.socket_target();
            let existing = links.outbound.remove(&key);
            writes.push(write_to_peer(existing, key, frame.clone(), timeouts, &self.stop));
        }

        let mut delivered = 0usize;
        let mut failures = Vec::new();
        for (key, written) in join_all(writes).await {
            match written {
                Ok(stream) => {
                    links.outbound.insert(key, stream);
                    delivered += 1;
                }
                Err(TransportError::Closed) => return Err(TransportError::Closed),
                Err(e) => {
                    warn!(parent: links.tasks.span(), peer = %key, error = %e, "dropping mesh link");
                    failures.push(format!("{key}: {e}"));
                }
            }
        }

        debug!(parent: links.tasks.span(), bytes = frame.len(), delivered, "sending eviction");
        if delivered == 0 && !failures.is_empty() {
            return Err(TransportError::CommunicationBroken(failures.join("; ")));
        }
        self.stats.record_sent();
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop.cancel();
        let links = self.links.lock().await.take();
        if let Some(mut links) = links {
            for (_, mut stream) in links.outbound.drain() {
                let _ = stream.shutdown().await;
            }
            links.tasks.shutdown(self.config.close_timeout()).await;
            info!(parent: links.tasks.span(), "mesh closed");
        }
    }
}

impl ClusterTransport for MeshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ReliableMulticast
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

#[derive(Debug, Clone, Copy)]
struct LinkTimeouts {
    dial: Duration,
    write: Duration,
}

/// Writes one frame to `peer`, dialing it first if there is no open link.
///
/// Hands the link back on success so it can be reused for the next frame.
async fn write_to_peer(
    existing: Option<TcpStream>,
    peer: String,
    frame: Bytes,
    timeouts: LinkTimeouts,
    stop: &CancellationToken,
) -> (String, TransportResult<TcpStream>) {
    let written: TransportResult<TcpStream> = async {
        let mut stream = match existing {
            Some(stream) => stream,
            None => dial(&peer, timeouts.dial, stop).await?,
        };
        write_frame(&mut stream, &frame, timeouts.write, stop).await?;
        Ok(stream)
    }
    .await;
    (peer, written)
}

async fn dial(peer: &str, limit: Duration, stop: &CancellationToken) -> TransportResult<TcpStream> {
    let connected = tokio::select! {
        () = stop.cancelled() => return Err(TransportError::Closed),
        connected = tokio::time::timeout(limit, TcpStream::connect(peer)) => connected,
    };
    let stream = connected
        .map_err(|_| TransportError::CommunicationBroken(format!("connect to {peer} timed out")))?
        .map_err(|e| TransportError::CommunicationBroken(format!("connect to {peer}: {e}")))?;
    stream.set_nodelay(true)?;
    debug!(peer, "mesh link established");
    Ok(stream)
}

async fn accept_loop(
    listener: TcpListener,
    codec: FrameCodec,
    inbound: Inbound,
    tasks: Arc<TaskSet>,
    closed: Arc<AtomicBool>,
) {
    let cancel = tasks.token();
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "accepted mesh peer");
                tasks.spawn(peer_loop(
                    stream,
                    addr,
                    codec.clone(),
                    inbound.clone(),
                    tasks.token(),
                ));
            }
            Err(e) => {
                error!(error = %e, "accept failed, closing transport");
                closed.store(true, Ordering::Release);
                tasks.cancel();
                break;
            }
        }
    }
}

async fn peer_loop(
    stream: TcpStream,
    addr: SocketAddr,
    codec: FrameCodec,
    inbound: Inbound,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, codec);
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => inbound.frame(frame),
            Some(Err(e)) => {
                warn!(peer = %addr, error = %e, "mesh peer receive failed");
                break;
            }
            None => {
                debug!(peer = %addr, "mesh peer disconnected");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::channel_handler;

    #[tokio::test]
    async fn test_init_requires_address() {
        let t = MeshTransport::new(TransportConfig::new(TransportKind::ReliableMulticast));
        let (handler, _rx) = channel_handler();
        let err = t.init(handler, Span::none()).await.unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_init_rejects_bad_peer() {
        let t = MeshTransport::new(
            TransportConfig::new(TransportKind::ReliableMulticast)
                .with_address("127.0.0.1:1")
                .with_peer("no-port"),
        );
        let (handler, _rx) = channel_handler();
        let err = t.init(handler, Span::none()).await.unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_send_with_unreachable_peer_is_broken() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = reserved.local_addr().unwrap().port();
        drop(reserved);
        let listen = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listen_port = listen.local_addr().unwrap().port();
        drop(listen);

        let t = MeshTransport::new(
            TransportConfig::new(TransportKind::ReliableMulticast)
                .with_address(format!("127.0.0.1:{listen_port}"))
                .with_peer(format!("127.0.0.1:{dead_port}"))
                .with_handshake_timeout(Duration::from_millis(500)),
        );
        let (handler, _rx) = channel_handler();
        t.init(handler, Span::none()).await.unwrap();

        let err = t.send(Bytes::from_static(b"key")).await.unwrap_err();
        assert!(matches!(err, TransportError::CommunicationBroken(_)));
        t.close().await;
    }

    fn free_port() -> u16 {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        reserved.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_dead_peer_does_not_delay_live_peer() {
        let live = MeshTransport::new(
            TransportConfig::new(TransportKind::ReliableMulticast)
                .with_address(format!("127.0.0.1:{}", free_port())),
        );
        let (handler, mut rx) = channel_handler();
        live.init(handler, Span::none()).await.unwrap();
        let live_addr = live.local_addr().await.unwrap();

        // non-routable, so the dial hangs until the handshake timeout
        let t = MeshTransport::new(
            TransportConfig::new(TransportKind::ReliableMulticast)
                .with_address(format!("127.0.0.1:{}", free_port()))
                .with_peer("10.255.255.1:9")
                .with_peer(live_addr.to_string())
                .with_handshake_timeout(Duration::from_secs(2)),
        );
        let (handler, _rx) = channel_handler();
        t.init(handler, Span::none()).await.unwrap();

        let (sent, got) = tokio::join!(
            t.send(Bytes::from_static(b"key")),
            tokio::time::timeout(Duration::from_millis(500), rx.recv()),
        );
        assert_eq!(got.unwrap(), Some(Bytes::from_static(b"key")));
        assert!(sent.is_ok(), "one live peer is enough");

        t.close().await;
        live.close().await;
    }

    #[tokio::test]
    async fn test_close_completes_while_peer_stops_reading() {
        let stalled = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stalled_addr = stalled.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let (stream, _) = stalled.accept().await.unwrap();
            std::future::pending::<()>().await;
            drop(stream);
        });

        let t = Arc::new(MeshTransport::new(
            TransportConfig::new(TransportKind::ReliableMulticast)
                .with_address(format!("127.0.0.1:{}", free_port()))
                .with_peer(stalled_addr.to_string()),
        ));
        let (handler, _rx) = channel_handler();
        t.init(handler, Span::none()).await.unwrap();

        let sender = Arc::clone(&t);
        let flood = tokio::spawn(async move {
            let payload = Bytes::from(vec![3u8; 60_000]);
            loop {
                if let Err(e) = sender.send(payload.clone()).await {
                    return e;
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        let closed = tokio::time::timeout(Duration::from_secs(5), t.close()).await;
        assert!(closed.is_ok(), "close must not wait on a stalled write");

        let err = tokio::time::timeout(Duration::from_secs(5), flood)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_init_rejects_port_zero() {
        let t = MeshTransport::new(
            TransportConfig::new(TransportKind::ReliableMulticast).with_address("127.0.0.1:0"),
        );
        let (handler, _rx) = channel_handler();
        let err = t.init(handler, Span::none()).await.unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }
}
