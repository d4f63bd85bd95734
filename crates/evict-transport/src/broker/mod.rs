//! Broker fanout transport.
//!
//! Every node publishes evictions to one durable fanout exchange and consumes
//! from a private queue bound to it. The routing key is the node's identity in
//! hex; deliveries carrying our own key are self-echoes. Message bodies are the
//! raw payload with no frame header.
//!
//! When the consume loop fails, a supervisor reconnects with backoff, swaps in
//! the new publisher and resumes consuming.

mod amqp;
mod memory;

pub use amqp::AmqpConnector;
pub use memory::InMemoryBroker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use evict_proto::LocalIdentity;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::handler::{Inbound, SharedHandler};
use crate::lifecycle::{require_active, TaskSet};
use crate::reconnect::{reconnect_with_backoff, Reconnect, ReconnectConfig};
use crate::transport::{
    check_payload, BoxFuture, ClusterTransport, StatsCounters, TransportKind, TransportStats,
};

/// Where a node publishes and what it consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerBinding {
    /// Fanout exchange name.
    pub exchange: String,
    /// Routing key used for publishing and for the queue binding.
    pub routing_key: String,
    /// Unacknowledged deliveries allowed in flight.
    pub prefetch: u16,
}

/// One message taken from the node's queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag used to acknowledge the delivery.
    pub delivery_tag: u64,
    /// Routing key the publisher used.
    pub routing_key: String,
    /// Message body.
    pub payload: Bytes,
}

/// Publishes to the bound exchange.
pub trait BrokerPublisher: Send + Sync {
    /// Publishes one persistent message.
    fn publish<'a>(&'a self, payload: Bytes) -> BoxFuture<'a, TransportResult<()>>;

    /// Closes the underlying connection.
    fn close<'a>(&'a self) -> BoxFuture<'a, ()>;
}

/// Pulls deliveries from the node's queue.
pub trait DeliveryStream: Send {
    /// Waits for the next delivery. `Ok(None)` means the consumer was cancelled
    /// by the broker or the connection went away.
    fn next_delivery<'a>(&'a mut self) -> BoxFuture<'a, TransportResult<Option<Delivery>>>;

    /// Acknowledges a delivery.
    fn ack<'a>(&'a mut self, delivery_tag: u64) -> BoxFuture<'a, TransportResult<()>>;
}

/// A live broker connection: exchange declared, queue bound, consumer started.
pub struct BrokerSession {
    /// Publishing side.
    pub publisher: Arc<dyn BrokerPublisher>,
    /// Consuming side.
    pub deliveries: Box<dyn DeliveryStream>,
}

/// Establishes broker sessions.
pub trait BrokerConnector: Send + Sync {
    /// Connects, declares the exchange, binds a private queue and starts
    /// consuming.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BrokerUnreachable`] if any step fails.
    fn connect<'a>(&'a self, binding: &'a BrokerBinding) -> BoxFuture<'a, TransportResult<BrokerSession>>;
}

/// State shared between `send` and the consume supervisor.
struct BrokerShared {
    connector: Arc<dyn BrokerConnector>,
    binding: BrokerBinding,
    reconnect: ReconnectConfig,
    publisher: RwLock<Option<Arc<dyn BrokerPublisher>>>,
    stats: Arc<StatsCounters>,
}

impl BrokerShared {
    fn publisher(&self) -> Option<Arc<dyn BrokerPublisher>> {
        self.publisher.read().clone()
    }

    fn replace_publisher(&self, publisher: Arc<dyn BrokerPublisher>) -> Option<Arc<dyn BrokerPublisher>> {
        self.publisher.write().replace(publisher)
    }
}

/// Pub/sub transport over a message broker.
pub struct BrokerTransport {
    config: TransportConfig,
    identity: LocalIdentity,
    connector: Option<Arc<dyn BrokerConnector>>,
    stats: Arc<StatsCounters>,
    closed: AtomicBool,
    active: Mutex<Option<(Arc<BrokerShared>, TaskSet)>>,
}

impl BrokerTransport {
    /// Creates a transport that talks AMQP to the configured broker.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a transport over an arbitrary broker backend.
    #[must_use]
    pub fn with_connector(config: TransportConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        Self::build(config, Some(connector))
    }

    fn build(config: TransportConfig, connector: Option<Arc<dyn BrokerConnector>>) -> Self {
        Self {
            config,
            identity: LocalIdentity::generate(),
            connector,
            stats: Arc::new(StatsCounters::default()),
            closed: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    /// The exchange and routing key this node uses.
    #[must_use]
    pub fn binding(&self) -> BrokerBinding {
        BrokerBinding {
            exchange: self.config.exchange_name().to_string(),
            routing_key: self.identity.to_hex(),
            prefetch: self.config.prefetch,
        }
    }

    async fn start(&self, handler: SharedHandler, log: Span) -> TransportResult<()> {
        let mut active = self.active.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if active.is_some() {
            return Err(TransportError::Configuration(
                "transport already initialized".to_string(),
            ));
        }

        let connector: Arc<dyn BrokerConnector> = match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::new(AmqpConnector::new(&self.config.endpoint()?)),
        };
        let binding = self.binding();
        let session = connector.connect(&binding).await?;

        let span = info_span!(
            parent: &log,
            "transport",
            kind = %TransportKind::Broker,
            identity = %self.identity,
            exchange = %binding.exchange
        );
        let shared = Arc::new(BrokerShared {
            connector,
            binding,
            reconnect: self.config.reconnect.clone(),
            publisher: RwLock::new(Some(session.publisher)),
            stats: Arc::clone(&self.stats),
        });
        let tasks = TaskSet::new(span);
        tasks.spawn(supervise(
            Arc::clone(&shared),
            session.deliveries,
            Inbound::new(handler, Arc::clone(&self.stats)),
            tasks.token(),
        ));
        info!(parent: tasks.span(), "consuming from broker");

        *active = Some((shared, tasks));
        Ok(())
    }

    async fn publish(&self, payload: Bytes) -> TransportResult<()> {
        check_payload(payload.len(), self.max_message_size())?;
        let active = self.active.lock().await;
        let (shared, tasks) = require_active(active.as_ref(), &self.closed)?;

        let Some(publisher) = shared.publisher() else {
            return Err(TransportError::BrokerUnreachable(
                "no broker connection".to_string(),
            ));
        };
        debug!(parent: tasks.span(), bytes = payload.len(), "sending eviction");
        publisher.publish(payload).await?;
        shared.stats.record_sent();
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let active = self.active.lock().await.take();
        if let Some((shared, tasks)) = active {
            tasks.shutdown(self.config.close_timeout()).await;
            let publisher = shared.publisher.write().take();
            if let Some(publisher) = publisher {
                publisher.close().await;
            }
            info!(parent: tasks.span(), "broker transport closed");
        }
    }
}

impl ClusterTransport for BrokerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broker
    }

    fn local_identity(&self) -> LocalIdentity {
        self.identity
    }

    fn max_message_size(&self) -> Option<usize> {
        self.config.effective_max_message_size()
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

/// Runs consume loops, reconnecting after each failure until cancelled.
async fn supervise(
    shared: Arc<BrokerShared>,
    mut deliveries: Box<dyn DeliveryStream>,
    inbound: Inbound,
    cancel: CancellationToken,
) {
    loop {
        let failure = tokio::select! {
            () = cancel.cancelled() => return,
            failure = consume(deliveries.as_mut(), &shared.binding.routing_key, &inbound) => failure,
        };
        warn!(error = %failure, "consume loop failed, reconnecting");

        let outcome = reconnect_with_backoff(&shared.reconnect, &cancel, || {
            shared.connector.connect(&shared.binding)
        })
        .await;

        match outcome {
            Reconnect::Connected(session) => {
                if let Some(stale) = shared.replace_publisher(session.publisher) {
                    stale.close().await;
                }
                deliveries = session.deliveries;
                info!("reconnected to broker");
            }
            Reconnect::GaveUp(e) => {
                error!(error = %e, "giving up on broker");
                shared.publisher.write().take();
                return;
            }
            Reconnect::Cancelled => return,
        }
    }
}

/// Delivers until the stream fails; returns the failure.
async fn consume(
    deliveries: &mut dyn DeliveryStream,
    own_key: &str,
    inbound: &Inbound,
) -> TransportError {
    loop {
        let delivery = match deliveries.next_delivery().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                return TransportError::BrokerUnreachable("consumer cancelled".to_string());
            }
            Err(e) => return e,
        };

        if delivery.routing_key == own_key {
            inbound.self_echo(delivery.payload.len());
        } else {
            inbound.deliver(delivery.payload);
        }

        if let Err(e) = deliveries.ack(delivery.delivery_tag).await {
            return e;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::channel_handler;
    use std::time::Duration;

    fn transport(broker: &InMemoryBroker) -> BrokerTransport {
        BrokerTransport::with_connector(
            TransportConfig::new(TransportKind::Broker).with_local_path("test-cache"),
            Arc::new(broker.clone()),
        )
    }

    #[test]
    fn test_binding_uses_hex_identity() {
        let t = transport(&InMemoryBroker::new());
        let binding = t.binding();
        assert_eq!(binding.exchange, "test-cache");
        assert_eq!(binding.routing_key, t.local_identity().to_hex());
        assert_eq!(binding.prefetch, 10);
        assert_eq!(t.max_message_size(), None);
    }

    #[tokio::test]
    async fn test_init_fails_when_broker_down() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let t = transport(&broker);
        let (handler, _rx) = channel_handler();

        let err = t.init(handler, Span::none()).await.unwrap_err();
        assert!(matches!(err, TransportError::BrokerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_fanout_skips_sender() {
        let broker = InMemoryBroker::new();
        let a = transport(&broker);
        let b = transport(&broker);
        let (ha, mut rx_a) = channel_handler();
        let (hb, mut rx_b) = channel_handler();
        a.init(ha, Span::none()).await.unwrap();
        b.init(hb, Span::none()).await.unwrap();

        a.send(Bytes::from_static(b"order:7")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Bytes::from_static(b"order:7"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());
        assert_eq!(a.stats().self_echoes, 1);
        assert_eq!(a.stats().sent, 1);
        assert_eq!(b.stats().received, 1);
        assert_eq!(broker.acked(), 2);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let broker = InMemoryBroker::new();
        let t = transport(&broker);
        let (handler, _rx) = channel_handler();
        t.init(handler, Span::none()).await.unwrap();
        t.close().await;
        t.close().await;

        let err = t.send(Bytes::from_static(b"k")).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert_eq!(broker.consumer_count("test-cache"), 0);
    }
}
