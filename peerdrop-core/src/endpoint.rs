//! Endpoint and transport-method data model (spec §3 "Endpoint").

use serde::{Deserialize, Serialize};

/// One of the closed set of ways a peer can be reached, ordered by default
/// preference (spec §3, §4.5). Declaration order is the default method
/// order the orchestrator tries, before any registry hint is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum TransportMethod {
    ReliableStream,
    ReliableStreamWithPortMapping,
    StreamHolePunch,
    StreamSimultaneousOpen,
    Datagram,
    DatagramWithPortMapping,
    DatagramHolePunch,
    DatagramAdvancedPunch,
    InteractiveCandidatePair,
    Relayed,
    SignaledFallback,
    V6Native,
}

impl TransportMethod {
    /// The default ordered attempt list built by the orchestrator (spec §4.5
    /// step 1), before any connection-registry hint is applied.
    pub const DEFAULT_ORDER: [TransportMethod; 10] = [
        TransportMethod::ReliableStream,
        TransportMethod::ReliableStreamWithPortMapping,
        TransportMethod::StreamHolePunch,
        TransportMethod::StreamSimultaneousOpen,
        TransportMethod::Datagram,
        TransportMethod::DatagramWithPortMapping,
        TransportMethod::DatagramHolePunch,
        TransportMethod::InteractiveCandidatePair,
        TransportMethod::Relayed,
        TransportMethod::SignaledFallback,
    ];

    pub fn is_datagram_like(self) -> bool {
        matches!(
            self,
            TransportMethod::Datagram
                | TransportMethod::DatagramWithPortMapping
                | TransportMethod::DatagramHolePunch
                | TransportMethod::DatagramAdvancedPunch
        )
    }
}

/// Transport-layer protocol an endpoint or connector call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Stream,
    Datagram,
}

/// An (address, port, transport-tag) triple a peer is reachable at.
///
/// Produced at transport discovery and consumed by the orchestrator; has no
/// independent lifetime of its own (spec §3 Lifecycle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub method: TransportMethod,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16, method: TransportMethod) -> Self {
        Self {
            address: address.into(),
            port,
            method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_starts_with_reliable_stream() {
        assert_eq!(
            TransportMethod::DEFAULT_ORDER[0],
            TransportMethod::ReliableStream
        );
    }

    #[test]
    fn datagram_like_classification() {
        assert!(TransportMethod::Datagram.is_datagram_like());
        assert!(TransportMethod::DatagramHolePunch.is_datagram_like());
        assert!(!TransportMethod::ReliableStream.is_datagram_like());
        assert!(!TransportMethod::Relayed.is_datagram_like());
    }
}
