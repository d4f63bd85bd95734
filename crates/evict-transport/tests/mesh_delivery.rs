//! Reliable multicast mesh between three local nodes.

use std::time::Duration;

use bytes::Bytes;
use evict_transport::{
    channel_handler, ClusterTransport, MeshTransport, TransportConfig, TransportKind,
};
use tokio_test::assert_ok;
use tracing::Span;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn node(port: u16, peers: &[u16]) -> MeshTransport {
    let config = peers.iter().fold(
        TransportConfig::new(TransportKind::ReliableMulticast)
            .with_address(format!("127.0.0.1:{port}")),
        |config, peer| config.with_peer(format!("127.0.0.1:{peer}")),
    );
    MeshTransport::new(config)
}

#[tokio::test]
async fn test_mesh_delivers_to_every_other_member() {
    let ports = [free_port(), free_port(), free_port()];
    // node a lists itself to exercise self-echo suppression
    let a = node(ports[0], &ports);
    let b = node(ports[1], &[ports[0], ports[2]]);
    let c = node(ports[2], &[ports[0], ports[1]]);

    let (ha, mut rx_a) = channel_handler();
    let (hb, mut rx_b) = channel_handler();
    let (hc, mut rx_c) = channel_handler();
    assert_ok!(a.init(ha, Span::none()).await);
    assert_ok!(b.init(hb, Span::none()).await);
    assert_ok!(c.init(hc, Span::none()).await);

    let payload = Bytes::from((0u8..10).collect::<Vec<_>>());
    a.send(payload.clone()).await.unwrap();

    for rx in [&mut rx_b, &mut rx_c] {
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, payload);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx_a.try_recv().is_err());
    assert_eq!(a.stats().self_echoes, 1);
    assert_eq!(b.stats().received, 1);
    assert_eq!(c.stats().received, 1);

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn test_mesh_redials_restarted_peer() {
    let ports = [free_port(), free_port()];
    let a = node(ports[0], &[ports[1]]);
    let (ha, _rx_a) = channel_handler();
    assert_ok!(a.init(ha, Span::none()).await);

    let b = node(ports[1], &[]);
    let (hb, mut rx_b) = channel_handler();
    assert_ok!(b.init(hb, Span::none()).await);
    a.send(Bytes::from_static(b"first")).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, Bytes::from_static(b"first"));
    b.close().await;

    // the stale link fails on one of the next writes and is dropped
    let mut saw_failure = false;
    for _ in 0..20 {
        if a.send(Bytes::from_static(b"lost")).await.is_err() {
            saw_failure = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_failure);

    let b2 = node(ports[1], &[]);
    let (hb2, mut rx_b2) = channel_handler();
    assert_ok!(b2.init(hb2, Span::none()).await);
    assert_ok!(a.send(Bytes::from_static(b"second")).await);
    let got = tokio::time::timeout(Duration::from_secs(2), rx_b2.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, Bytes::from_static(b"second"));

    a.close().await;
    b2.close().await;
}
