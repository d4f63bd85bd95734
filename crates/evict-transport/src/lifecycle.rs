//! Background task ownership for one transport instance.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Instrument, Span};

use crate::error::{TransportError, TransportResult};

/// Tasks spawned by a transport, stopped together on close.
///
/// Every task observes the shared cancellation token; shutdown cancels it and
/// joins each task with a bounded wait.
#[derive(Debug)]
pub(crate) struct TaskSet {
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl TaskSet {
    pub(crate) fn new(span: Span) -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            span,
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    /// Spawns `fut` inside the transport span.
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut.instrument(self.span.clone()));
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Signals every task to stop without waiting.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels all tasks and waits up to `wait` for each to finish.
    pub(crate) async fn shutdown(&self, wait: Duration) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(wait, handle).await.is_err() {
                warn!(timeout_ms = wait.as_millis() as u64, "task did not stop in time");
                abort.abort();
            }
        }
    }
}

/// Resolves the active connection state of a transport.
///
/// Distinguishes a transport that was closed from one that never finished
/// `init`.
pub(crate) fn require_active<T>(slot: Option<T>, closed: &AtomicBool) -> TransportResult<T> {
    match slot {
        _ if closed.load(Ordering::Acquire) => Err(TransportError::Closed),
        Some(active) => Ok(active),
        None => Err(TransportError::NotInitialized),
    }
}

/// Writes a whole frame to a stream link.
///
/// A write that stalls longer than `limit` is a broken link; cancelling
/// `stop` abandons the write with [`TransportError::Closed`]. Either way the
/// stream may hold a partial frame and must not be reused.
pub(crate) async fn write_frame<W>(
    writer: &mut W,
    frame: &[u8],
    limit: Duration,
    stop: &CancellationToken,
) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        () = stop.cancelled() => Err(TransportError::Closed),
        written = tokio::time::timeout(limit, writer.write_all(frame)) => match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::CommunicationBroken(e.to_string())),
            Err(_) => Err(TransportError::CommunicationBroken(format!(
                "write stalled for {}ms",
                limit.as_millis()
            ))),
        },
    }
}
