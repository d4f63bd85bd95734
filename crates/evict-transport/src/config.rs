//! Transport configuration.

use std::path::Path;
use std::time::Duration;

use evict_proto::EndpointAddress;
use serde::{Deserialize, Serialize};

use crate::error::{TransportError, TransportResult};
use crate::reconnect::ReconnectConfig;
use crate::transport::{TransportKind, DEFAULT_MAX_MESSAGE_SIZE};

/// Default relay endpoint.
pub const DEFAULT_RELAY_ADDRESS: &str = "127.0.0.1:9999";

/// Default broker endpoint.
pub const DEFAULT_BROKER_ADDRESS: &str = "guest:guest@localhost:5672";

/// Exchange used when no local path is configured.
pub const DEFAULT_EXCHANGE: &str = "l2cache-evictions";

/// Hello payload sent when no local path is configured.
pub const DEFAULT_ALIAS: &str = "<Localpath>";

/// Default broker prefetch window.
pub const DEFAULT_PREFETCH: u16 = 10;

/// Configuration for one transport instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Which transport to build.
    pub kind: TransportKind,
    /// `[user[:password]@]host:port`. Multicast: group and port. Reliable
    /// multicast: local listen endpoint. Broker: broker endpoint, host may
    /// carry `/vhost`. Relay: relay server.
    pub address: Option<String>,
    /// Node path. Relay alias and broker exchange name.
    pub local_path: Option<String>,
    /// Other members of a reliable multicast mesh.
    pub peers: Vec<String>,
    /// Overrides the transport's maximum message size.
    pub max_message_size: Option<usize>,
    /// Receive poll timeout in milliseconds.
    pub receive_timeout_ms: u64,
    /// Connect and handshake timeout in milliseconds.
    pub handshake_timeout_ms: u64,
    /// How long `close` waits for each background task, in milliseconds.
    pub close_timeout_ms: u64,
    /// Longest a single frame write may stall on a TCP link, in milliseconds.
    pub send_timeout_ms: u64,
    /// Broker prefetch window.
    pub prefetch: u16,
    /// Broker reconnection policy.
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(TransportKind::default())
    }
}

impl TransportConfig {
    /// Creates a configuration for `kind` with default settings.
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            address: None,
            local_path: None,
            peers: Vec::new(),
            max_message_size: None,
            receive_timeout_ms: 1_000,
            handshake_timeout_ms: 10_000,
            close_timeout_ms: 2_000,
            send_timeout_ms: 5_000,
            prefetch: DEFAULT_PREFETCH,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Parses a JSON configuration document.
    pub fn from_json(json: &str) -> TransportResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| TransportError::Configuration(format!("invalid transport config: {e}")))
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> TransportResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            TransportError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Sets the endpoint address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets the local path.
    #[must_use]
    pub fn with_local_path(mut self, path: impl Into<String>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    /// Adds a mesh peer.
    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peers.push(peer.into());
        self
    }

    /// Overrides the maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Sets the receive poll timeout.
    #[must_use]
    pub const fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the connect and handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the close join timeout.
    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the stream write timeout.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the broker prefetch window.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the broker reconnection policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Receive poll timeout.
    #[must_use]
    pub const fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Connect and handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Close join timeout.
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Stream write timeout.
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Maximum message size for this kind, honoring the override.
    ///
    /// The broker is unbounded unless overridden.
    #[must_use]
    pub const fn effective_max_message_size(&self) -> Option<usize> {
        match (self.max_message_size, self.kind) {
            (Some(size), _) => Some(size),
            (None, TransportKind::Broker) => None,
            (None, _) => Some(DEFAULT_MAX_MESSAGE_SIZE),
        }
    }

    /// Parses the configured address.
    ///
    /// Missing addresses fall back to the relay and broker defaults; the
    /// multicast and reliable multicast transports require one.
    pub fn endpoint(&self) -> TransportResult<EndpointAddress> {
        let fallback = match self.kind {
            TransportKind::Relay => Some(DEFAULT_RELAY_ADDRESS),
            TransportKind::Broker => Some(DEFAULT_BROKER_ADDRESS),
            TransportKind::Multicast | TransportKind::ReliableMulticast => None,
        };
        let raw = match (self.address.as_deref(), fallback) {
            (Some(address), _) if !address.trim().is_empty() => address,
            (_, Some(default)) => default,
            _ => {
                return Err(TransportError::Configuration(format!(
                    "{} transport requires an address",
                    self.kind
                )));
            }
        };
        Ok(raw.parse()?)
    }

    /// Parses the mesh peer list.
    pub fn peer_endpoints(&self) -> TransportResult<Vec<EndpointAddress>> {
        self.peers
            .iter()
            .map(|peer| peer.parse().map_err(TransportError::from))
            .collect()
    }

    /// Alias sent in the relay `Hello`.
    #[must_use]
    pub fn relay_alias(&self) -> &str {
        self.local_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_ALIAS)
    }

    /// Fanout exchange name for the broker.
    #[must_use]
    pub fn exchange_name(&self) -> &str {
        self.local_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_EXCHANGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.kind, TransportKind::Relay);
        assert_eq!(config.receive_timeout(), Duration::from_secs(1));
        assert_eq!(config.send_timeout(), Duration::from_secs(5));
        assert_eq!(config.prefetch, 10);
        assert_eq!(config.relay_alias(), "<Localpath>");
        assert_eq!(config.exchange_name(), "l2cache-evictions");
    }

    #[test]
    fn test_max_message_size_per_kind() {
        assert_eq!(
            TransportConfig::new(TransportKind::Multicast).effective_max_message_size(),
            Some(65_000)
        );
        assert_eq!(
            TransportConfig::new(TransportKind::Broker).effective_max_message_size(),
            None
        );
        assert_eq!(
            TransportConfig::new(TransportKind::Broker)
                .with_max_message_size(1024)
                .effective_max_message_size(),
            Some(1024)
        );
    }

    #[test]
    fn test_endpoint_defaults() {
        let relay = TransportConfig::new(TransportKind::Relay).endpoint().unwrap();
        assert_eq!(relay.host, "127.0.0.1");
        assert_eq!(relay.port, 9999);

        let broker = TransportConfig::new(TransportKind::Broker).endpoint().unwrap();
        assert_eq!(broker.user.as_deref(), Some("guest"));
        assert_eq!(broker.port, 5672);
    }

    #[test]
    fn test_multicast_requires_address() {
        let err = TransportConfig::new(TransportKind::Multicast)
            .endpoint()
            .unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn test_malformed_address_is_configuration_error() {
        let err = TransportConfig::new(TransportKind::Relay)
            .with_address("relay-without-port")
            .endpoint()
            .unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn test_from_json() {
        let config = TransportConfig::from_json(
            r#"{
                "kind": "reliable-multicast",
                "address": "0.0.0.0:7000",
                "peers": ["10.0.0.2:7000", "10.0.0.3:7000"],
                "reconnect": { "max_attempts": 3 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.kind, TransportKind::ReliableMulticast);
        assert_eq!(config.peer_endpoints().unwrap().len(), 2);
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.close_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_from_json_rejects_unknown_kind() {
        let err = TransportConfig::from_json(r#"{"kind": "smoke-signals"}"#).unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn test_builder() {
        let config = TransportConfig::new(TransportKind::Relay)
            .with_address("relay.local:9999")
            .with_local_path("node-1")
            .with_handshake_timeout(Duration::from_millis(250))
            .with_send_timeout(Duration::from_millis(300));

        assert_eq!(config.relay_alias(), "node-1");
        assert_eq!(config.handshake_timeout(), Duration::from_millis(250));
        assert_eq!(config.send_timeout(), Duration::from_millis(300));
    }
}
