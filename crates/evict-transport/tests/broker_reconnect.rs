//! Broker transport recovery after a broker outage.
//!
//! These tests verify:
//! 1. Evictions fan out to every other node and never back to the sender
//! 2. A broker outage is survived without restarting the transports
//! 3. Messages sent before the outage are not delivered twice

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use evict_transport::{
    channel_handler, BrokerTransport, ClusterTransport, InMemoryBroker, ReconnectConfig,
    TransportConfig, TransportKind,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::assert_err;
use tracing::Span;

const EXCHANGE: &str = "orders-cache";

fn node(broker: &InMemoryBroker) -> BrokerTransport {
    let reconnect = ReconnectConfig::default()
        .with_initial_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(50));
    BrokerTransport::with_connector(
        TransportConfig::new(TransportKind::Broker)
            .with_local_path(EXCHANGE)
            .with_reconnect(reconnect),
        Arc::new(broker.clone()),
    )
}

async fn recv(rx: &mut UnboundedReceiver<Bytes>) -> Bytes {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for eviction")
        .expect("handler channel closed")
}

async fn wait_for_consumers(broker: &InMemoryBroker, count: usize) -> bool {
    for _ in 0..250 {
        if broker.consumer_count(EXCHANGE) == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_recovers_after_broker_outage() {
    let broker = InMemoryBroker::new();
    let a = node(&broker);
    let b = node(&broker);
    let c = node(&broker);
    let (ha, mut rx_a) = channel_handler();
    let (hb, mut rx_b) = channel_handler();
    let (hc, mut rx_c) = channel_handler();
    a.init(ha, Span::none()).await.unwrap();
    b.init(hb, Span::none()).await.unwrap();
    c.init(hc, Span::none()).await.unwrap();

    a.send(Bytes::from_static(b"before")).await.unwrap();
    assert_eq!(recv(&mut rx_b).await, Bytes::from_static(b"before"));
    assert_eq!(recv(&mut rx_c).await, Bytes::from_static(b"before"));

    broker.set_reachable(false);
    assert_err!(a.send(Bytes::from_static(b"during")).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.set_reachable(true);
    assert!(wait_for_consumers(&broker, 3).await, "consumers never came back");

    // the publisher is swapped just after the consumer comes back
    let mut sent = false;
    for _ in 0..50 {
        if a.send(Bytes::from_static(b"after")).await.is_ok() {
            sent = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(sent, "send never succeeded after recovery");

    assert_eq!(recv(&mut rx_b).await, Bytes::from_static(b"after"));
    assert_eq!(recv(&mut rx_c).await, Bytes::from_static(b"after"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx_a.try_recv().is_err(), "sender must not receive its own evictions");
    assert!(rx_b.try_recv().is_err(), "no duplicate deliveries");
    assert!(rx_c.try_recv().is_err(), "no duplicate deliveries");
    assert_eq!(a.stats().self_echoes, 2);

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn test_gives_up_after_attempt_limit() {
    let broker = InMemoryBroker::new();
    let reconnect = ReconnectConfig::default()
        .with_initial_delay(Duration::from_millis(5))
        .with_max_attempts(Some(2));
    let t = BrokerTransport::with_connector(
        TransportConfig::new(TransportKind::Broker)
            .with_local_path(EXCHANGE)
            .with_reconnect(reconnect),
        Arc::new(broker.clone()),
    );
    let (handler, _rx) = channel_handler();
    t.init(handler, Span::none()).await.unwrap();

    broker.set_reachable(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    broker.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.consumer_count(EXCHANGE), 0);
    assert_err!(t.send(Bytes::from_static(b"k")).await);
    t.close().await;
}
