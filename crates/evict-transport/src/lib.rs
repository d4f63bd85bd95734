//! # evict-transport
//!
//! Cluster transports that carry cache eviction notifications between nodes.
//!
//! Every transport implements [`ClusterTransport`]: `init` with a
//! [`MessageHandler`], `send` payloads, `close`. Frames a node sent itself are
//! never handed back to its handler.
//!
//! | Kind | Type | Delivery |
//! |------|------|----------|
//! | `multicast` | [`MulticastTransport`] | UDP multicast group, best effort |
//! | `reliable-multicast` | [`MeshTransport`] | TCP mesh between configured peers |
//! | `broker` | [`BrokerTransport`] | fanout exchange on an AMQP broker, reconnects |
//! | `relay` | [`RelayClientTransport`] | TCP client of a broadcast relay |
//!
//! ## Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use evict_transport::{build_transport, channel_handler, TransportConfig, TransportKind};
//!
//! # async fn example() -> evict_transport::TransportResult<()> {
//! let config = TransportConfig::new(TransportKind::Relay)
//!     .with_address("10.0.0.5:9999")
//!     .with_local_path("web-01");
//! let transport = build_transport(config);
//!
//! let (handler, mut evictions) = channel_handler();
//! transport.init(handler, tracing::Span::current()).await?;
//! transport.send(Bytes::from_static(b"customer:42")).await?;
//!
//! while let Some(payload) = evictions.recv().await {
//!     println!("evict {payload:?}");
//! }
//! transport.close().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod config;
pub mod error;
pub mod factory;
pub mod handler;
mod lifecycle;
pub mod mesh;
pub mod multicast;
pub mod reconnect;
pub mod relay_client;
pub mod transport;

pub use broker::{
    AmqpConnector, BrokerBinding, BrokerConnector, BrokerPublisher, BrokerSession,
    BrokerTransport, Delivery, DeliveryStream, InMemoryBroker,
};
pub use config::TransportConfig;
pub use error::{TransportError, TransportResult};
pub use factory::build_transport;
pub use handler::{channel_handler, ChannelHandler, MessageHandler, SharedHandler};
pub use mesh::MeshTransport;
pub use multicast::MulticastTransport;
pub use reconnect::ReconnectConfig;
pub use relay_client::RelayClientTransport;
pub use transport::{
    BoxFuture, ClusterTransport, StatsCounters, TransportKind, TransportStats,
    DEFAULT_MAX_MESSAGE_SIZE,
};
