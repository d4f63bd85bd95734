//! In-process broker backend.
//!
//! Models a fanout exchange with one private queue per session. Taking the
//! broker offline drops every session, the way a broker restart would, so
//! reconnect behavior can be exercised without a real server.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{BrokerBinding, BrokerConnector, BrokerPublisher, BrokerSession, Delivery, DeliveryStream};
use crate::error::{TransportError, TransportResult};
use crate::transport::BoxFuture;

struct BrokerState {
    reachable: bool,
    generation: u64,
    exchanges: HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>,
    next_tag: u64,
    published: u64,
    acked: u64,
}

impl BrokerState {
    fn check(&self, generation: u64) -> TransportResult<()> {
        if !self.reachable {
            return Err(TransportError::BrokerUnreachable(
                "broker is offline".to_string(),
            ));
        }
        if generation != self.generation {
            return Err(TransportError::BrokerUnreachable(
                "connection was reset".to_string(),
            ));
        }
        Ok(())
    }
}

/// A fanout broker living inside the current process.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a reachable broker with no exchanges.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                generation: 0,
                exchanges: HashMap::new(),
                next_tag: 0,
                published: 0,
                acked: 0,
            })),
        }
    }

    /// Takes the broker offline or brings it back.
    ///
    /// Going offline resets every connection: queues are deleted, consumers
    /// see their stream end and publishers start failing.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock();
        if state.reachable && !reachable {
            state.generation += 1;
            state.exchanges.clear();
        }
        state.reachable = reachable;
    }

    /// Number of live consumers bound to `exchange`.
    #[must_use]
    pub fn consumer_count(&self, exchange: &str) -> usize {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .map_or(0, |queues| queues.iter().filter(|q| !q.is_closed()).count())
    }

    /// Messages accepted by the exchange.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.state.lock().published
    }

    /// Deliveries acknowledged by consumers.
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.state.lock().acked
    }
}

impl BrokerConnector for InMemoryBroker {
    fn connect<'a>(&'a self, binding: &'a BrokerBinding) -> BoxFuture<'a, TransportResult<BrokerSession>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if !state.reachable {
                return Err(TransportError::BrokerUnreachable(
                    "connection refused".to_string(),
                ));
            }
            let generation = state.generation;
            let (tx, rx) = mpsc::unbounded_channel();
            let queues = state.exchanges.entry(binding.exchange.clone()).or_default();
            queues.retain(|q| !q.is_closed());
            queues.push(tx);
            drop(state);

            Ok(BrokerSession {
                publisher: Arc::new(MemoryPublisher {
                    broker: self.clone(),
                    binding: binding.clone(),
                    generation,
                }),
                deliveries: Box::new(MemoryDeliveries {
                    broker: self.clone(),
                    rx,
                    generation,
                }),
            })
        })
    }
}

struct MemoryPublisher {
    broker: InMemoryBroker,
    binding: BrokerBinding,
    generation: u64,
}

impl BrokerPublisher for MemoryPublisher {
    fn publish<'a>(&'a self, payload: Bytes) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            let mut state = self.broker.state.lock();
            state.check(self.generation)?;
            state.published += 1;

            let mut tag = state.next_tag;
            if let Some(queues) = state.exchanges.get_mut(&self.binding.exchange) {
                queues.retain(|q| {
                    tag += 1;
                    q.send(Delivery {
                        delivery_tag: tag,
                        routing_key: self.binding.routing_key.clone(),
                        payload: payload.clone(),
                    })
                    .is_ok()
                });
            }
            state.next_tag = tag;
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

struct MemoryDeliveries {
    broker: InMemoryBroker,
    rx: mpsc::UnboundedReceiver<Delivery>,
    generation: u64,
}

impl DeliveryStream for MemoryDeliveries {
    fn next_delivery<'a>(&'a mut self) -> BoxFuture<'a, TransportResult<Option<Delivery>>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }

    fn ack<'a>(&'a mut self, _delivery_tag: u64) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            let mut state = self.broker.state.lock();
            state.check(self.generation)?;
            state.acked += 1;
            Ok(())
        })
    }
}
