//! The contract every cluster transport implements.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use evict_proto::LocalIdentity;
use serde::{Deserialize, Serialize};
use tracing::Span;

use crate::error::{TransportError, TransportResult};
use crate::handler::SharedHandler;

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Maximum message size of the socket transports.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_000;

/// Selects a concrete transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// UDP multicast group.
    Multicast,
    /// Reliable group delivery over a TCP mesh.
    ReliableMulticast,
    /// Fanout exchange on a message broker.
    Broker,
    /// TCP client of a broadcast relay server.
    #[default]
    Relay,
}

impl TransportKind {
    /// Canonical kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Multicast => "multicast",
            Self::ReliableMulticast => "reliable-multicast",
            Self::Broker => "broker",
            Self::Relay => "relay",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multicast" | "udp" => Ok(Self::Multicast),
            "reliable-multicast" | "reliable_multicast" | "rdm" | "mesh" => {
                Ok(Self::ReliableMulticast)
            }
            "broker" | "amqp" | "rabbitmq" => Ok(Self::Broker),
            "relay" | "tcp" => Ok(Self::Relay),
            other => Err(TransportError::Configuration(format!(
                "unknown transport kind '{other}'"
            ))),
        }
    }
}

/// Snapshot of a transport's message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Payloads handed to the network.
    pub sent: u64,
    /// Payloads delivered to the message handler.
    pub received: u64,
    /// Self-originated frames that were dropped.
    pub self_echoes: u64,
}

/// Live counters owned by one transport instance.
#[derive(Debug, Default)]
pub struct StatsCounters {
    sent: AtomicU64,
    received: AtomicU64,
    self_echoes: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_self_echo(&self) {
        self.self_echoes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            self_echoes: self.self_echoes.load(Ordering::Relaxed),
        }
    }
}

/// A peer-communication mechanism that disseminates eviction payloads.
///
/// Lifecycle: construct, `init` once, `send` any number of times, `close`.
/// Inbound payloads from other members are delivered to the handler passed to
/// `init` from a background task; frames this instance sent itself are
/// logged and dropped.
pub trait ClusterTransport: Send + Sync {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// The identity stamped on every outbound frame.
    fn local_identity(&self) -> LocalIdentity;

    /// Largest payload accepted by `send`, or `None` if unbounded.
    fn max_message_size(&self) -> Option<usize>;

    /// Connects and starts receiving.
    ///
    /// Background work runs inside a child of `log`, so the caller's
    /// subscriber decides where transport events go.
    ///
    /// # Errors
    ///
    /// Fails fast on missing or malformed configuration and on initial
    /// connect or handshake failure. Failures are not retried.
    fn init<'a>(&'a self, handler: SharedHandler, log: Span) -> BoxFuture<'a, TransportResult<()>>;

    /// Publishes one eviction payload to all other reachable members.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CommunicationBroken`] if the channel is
    /// unusable, [`TransportError::Closed`] after `close`.
    fn send<'a>(&'a self, payload: Bytes) -> BoxFuture<'a, TransportResult<()>>;

    /// Releases sockets and stops background tasks. Idempotent.
    fn close<'a>(&'a self) -> BoxFuture<'a, ()>;

    /// Current message counters.
    fn stats(&self) -> TransportStats;
}

/// Rejects payloads above `limit`.
pub(crate) fn check_payload(len: usize, limit: Option<usize>) -> TransportResult<()> {
    match limit {
        Some(limit) if len > limit => Err(TransportError::PayloadTooLarge { len, limit }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("multicast", TransportKind::Multicast; "multicast")]
    #[test_case("UDP", TransportKind::Multicast; "udp alias")]
    #[test_case("reliable-multicast", TransportKind::ReliableMulticast; "reliable multicast")]
    #[test_case("rdm", TransportKind::ReliableMulticast; "rdm alias")]
    #[test_case("RabbitMQ", TransportKind::Broker; "rabbitmq alias")]
    #[test_case(" relay ", TransportKind::Relay; "relay with whitespace")]
    #[test_case("tcp", TransportKind::Relay; "tcp alias")]
    fn test_kind_from_str(input: &str, expected: TransportKind) {
        assert_eq!(input.parse::<TransportKind>().unwrap(), expected);
    }

    #[test]
    fn test_kind_from_str_unknown() {
        let err = "carrier-pigeon".parse::<TransportKind>().unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn test_kind_display_round_trips() {
        for kind in [
            TransportKind::Multicast,
            TransportKind::ReliableMulticast,
            TransportKind::Broker,
            TransportKind::Relay,
        ] {
            assert_eq!(kind.to_string().parse::<TransportKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_stats_counters() {
        let counters = StatsCounters::default();
        counters.record_sent();
        counters.record_sent();
        assert_eq!(counters.record_received(), 1);
        counters.record_self_echo();

        assert_eq!(
            counters.snapshot(),
            TransportStats {
                sent: 2,
                received: 1,
                self_echoes: 1
            }
        );
    }

    #[test]
    fn test_check_payload() {
        assert!(check_payload(10, Some(10)).is_ok());
        assert!(check_payload(usize::MAX, None).is_ok());
        assert!(matches!(
            check_payload(11, Some(10)),
            Err(TransportError::PayloadTooLarge { len: 11, limit: 10 })
        ));
    }
}
