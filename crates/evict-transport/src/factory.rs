//! Builds a transport from configuration.

use crate::broker::BrokerTransport;
use crate::config::TransportConfig;
use crate::mesh::MeshTransport;
use crate::multicast::MulticastTransport;
use crate::relay_client::RelayClientTransport;
use crate::transport::{ClusterTransport, TransportKind};

/// Constructs the transport selected by `config.kind`.
///
/// No I/O happens here; configuration problems surface from `init`.
#[must_use]
pub fn build_transport(config: TransportConfig) -> Box<dyn ClusterTransport> {
    match config.kind {
        TransportKind::Multicast => Box::new(MulticastTransport::new(config)),
        TransportKind::ReliableMulticast => Box::new(MeshTransport::new(config)),
        TransportKind::Broker => Box::new(BrokerTransport::new(config)),
        TransportKind::Relay => Box::new(RelayClientTransport::new(config)),
    }
}
