//! Best-effort UDP multicast transport.
//!
//! One socket joins the group and receives; a second socket is connected to
//! the group and sends. Every datagram is one complete frame.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use evict_proto::{FrameCodec, LocalIdentity, OpCode, MAX_PAYLOAD_LEN};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Span};

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::handler::{Inbound, SharedHandler};
use crate::lifecycle::{require_active, TaskSet};
use crate::transport::{
    check_payload, BoxFuture, ClusterTransport, StatsCounters, TransportKind, TransportStats,
};

/// Receive buffer; larger than any UDP payload.
const RECV_BUFFER_LEN: usize = 64 * 1024;

/// Multicast group hop limit.
const MULTICAST_TTL: u32 = 1;

struct GroupLink {
    sender: UdpSocket,
    tasks: TaskSet,
}

/// Multicast datagram transport.
pub struct MulticastTransport {
    config: TransportConfig,
    codec: FrameCodec,
    stats: Arc<StatsCounters>,
    closed: Arc<AtomicBool>,
    link: Mutex<Option<GroupLink>>,
}

impl MulticastTransport {
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
            link: Mutex::new(None),
        }
    }

    fn group(&self) -> TransportResult<(Ipv4Addr, u16)> {
        let endpoint = self.config.endpoint()?;
        let group: Ipv4Addr = endpoint.host_name().parse().map_err(|_| {
            TransportError::Configuration(format!(
                "'{}' is not an IPv4 multicast group",
                endpoint.host
            ))
        })?;
        if !group.is_multicast() {
            return Err(TransportError::Configuration(format!(
                "{group} is not a multicast address"
            )));
        }
        Ok((group, endpoint.port))
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

        let (group, port) = self.group()?;
        let receiver = join_group(group, port)?;
        let sender = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        sender.set_multicast_ttl_v4(MULTICAST_TTL)?;
        sender.set_multicast_loop_v4(true)?;
        sender.connect((group, port)).await?;

        let span = info_span!(
            parent: &log,
            "transport",
            kind = %TransportKind::Multicast,
            identity = %self.codec.local_identity(),
            group = %group,
            port
        );
        let tasks = TaskSet::new(span);
        tasks.spawn(receive_loop(
            receiver,
            self.codec.clone(),
            Inbound::new(handler, Arc::clone(&self.stats)),
            self.config.receive_timeout(),
            Arc::clone(&self.closed),
            tasks.token(),
        ));
        info!(parent: tasks.span(), "joined multicast group");

        *link = Some(GroupLink { sender, tasks });
        Ok(())
    }

    async fn publish(&self, payload: Bytes) -> TransportResult<()> {
        check_payload(payload.len(), self.max_message_size())?;
        let link = self.link.lock().await;
        let link = require_active(link.as_ref(), &self.closed)?;

        let frame = self.codec.encode(&payload, OpCode::Evict)?;
        debug!(parent: link.tasks.span(), bytes = frame.len(), "sending eviction");
        let sent = link
            .sender
            .send(&frame)
            .await
            .map_err(|e| TransportError::CommunicationBroken(e.to_string()))?;
        if sent != frame.len() {
            return Err(TransportError::CommunicationBroken(format!(
                "sent {sent} of {} bytes",
                frame.len()
            )));
        }
        self.stats.record_sent();
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.tasks.shutdown(self.config.close_timeout()).await;
            info!(parent: link.tasks.span(), "left multicast group");
        }
    }
}

impl ClusterTransport for MulticastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Multicast
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

/// Binds the group port with address reuse and joins `group` on all interfaces.
fn join_group(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)))?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn receive_loop(
    socket: UdpSocket,
    codec: FrameCodec,
    inbound: Inbound,
    poll: Duration,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => {
                debug!("receive loop stopped");
                return;
            }
            r = tokio::time::timeout(poll, socket.recv_from(&mut buf)) => r,
        };
        match received {
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!(error = %e, "receiver got exception");
                break;
            }
            Ok(Ok((n, from))) => match codec.decode_datagram(&buf[..n]) {
                Ok(frame) => inbound.frame(frame),
                Err(e) => debug!(%from, bytes = n, error = %e, "dropping malformed datagram"),
            },
        }
    }
    // the group is unusable once its socket fails
    closed.store(true, Ordering::Release);
}
