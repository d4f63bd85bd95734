//! # evict-relay
//!
//! Broadcast relay for cache eviction notifications.
//!
//! Nodes using the relay transport connect over TCP, introduce themselves
//! with `Hello` and receive `Welcome`. Every `Evict` frame a node sends is
//! forwarded unchanged to every other connected node, never back to the
//! sender.
//!
//! ```text
//! ┌────────┐  Evict   ┌──────────────┐  Evict   ┌────────┐
//! │ node-1 │─────────►│ RelayServer  │─────────►│ node-2 │
//! └────────┘          │  PeerTable   │          └────────┘
//!                     │  fan-out     │  Evict   ┌────────┐
//!                     │              │─────────►│ node-3 │
//!                     └──────────────┘          └────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use evict_relay::{RelayConfig, RelayServer};
//!
//! # async fn run() -> evict_relay::RelayResult<()> {
//! let server = RelayServer::bind(RelayConfig::with_port(9999)).await?;
//! let shutdown = server.shutdown_token();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.cancel();
//! });
//! server.serve().await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broadcast;
pub mod config;
pub mod error;
pub mod peer;
pub mod server;
pub mod state;

pub use broadcast::{fan_out, Broadcast};
pub use config::{RelayConfig, DEFAULT_PORT};
pub use error::{Disconnect, RelayError, RelayResult};
pub use peer::{Peer, PeerHandle, PeerKey, PeerSummary, PeerTable};
pub use server::RelayServer;
pub use state::RelayState;
