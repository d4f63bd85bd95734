//! Inbound message callback.

use std::sync::Arc;

use bytes::Bytes;
use evict_proto::{Frame, OpCode};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::transport::StatsCounters;

/// Receives eviction payloads from other cluster members.
///
/// Called from a transport's background task, once per non-self frame.
/// Implementations must not block for long.
pub trait MessageHandler: Send + Sync {
    /// Handles one inbound payload.
    fn on_message(&self, payload: Bytes);
}

impl<F> MessageHandler for F
where
    F: Fn(Bytes) + Send + Sync,
{
    fn on_message(&self, payload: Bytes) {
        self(payload);
    }
}

/// Shared handle to a message handler.
pub type SharedHandler = Arc<dyn MessageHandler>;

/// Forwards inbound payloads into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl MessageHandler for ChannelHandler {
    fn on_message(&self, payload: Bytes) {
        // Receiver gone means the host stopped listening.
        let _ = self.tx.send(payload);
    }
}

/// Creates a handler that turns callbacks into a stream of payloads.
#[must_use]
pub fn channel_handler() -> (SharedHandler, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelHandler { tx }), rx)
}

/// Routes received frames: delivers evictions, drops self-echoes.
#[derive(Clone)]
pub(crate) struct Inbound {
    handler: SharedHandler,
    stats: Arc<StatsCounters>,
}

impl Inbound {
    pub(crate) fn new(handler: SharedHandler, stats: Arc<StatsCounters>) -> Self {
        Self { handler, stats }
    }

    /// Hands a payload to the handler.
    pub(crate) fn deliver(&self, payload: Bytes) {
        let n = self.stats.record_received();
        debug!(bytes = payload.len(), count = n, "received eviction");
        self.handler.on_message(payload);
    }

    pub(crate) fn self_echo(&self, bytes: usize) {
        self.stats.record_self_echo();
        debug!(bytes, "got my own eviction, dropped");
    }

    /// Dispatches a decoded frame.
    pub(crate) fn frame(&self, frame: Frame) {
        if frame.sent_by_me() {
            self.self_echo(frame.payload.len());
            return;
        }
        match frame.opcode() {
            OpCode::Evict => self.deliver(frame.payload),
            other => trace!(opcode = %other, bytes = frame.payload.len(), "ignoring frame"),
        }
    }
}
