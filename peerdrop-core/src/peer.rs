//! Peer identity and per-download statistics (spec §3 "Peer statistics").

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A stable peer identifier, opaque to the core.
///
/// Per the §9 open question, this must be a stable identifier handed in by
/// the caller (e.g. from the out-of-scope DHT/discovery registry), never a
/// transient `remote_addr:remote_port` pair — a peer can be reachable at
/// different endpoints across attempts and methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// EWMA smoothing factor used for per-peer throughput, per spec §3.
pub const EWMA_ALPHA: f64 = 0.3;

/// Per-peer statistics tracked for the lifetime of one download.
///
/// Allocated at download start, discarded at download end (spec §3
/// Lifecycle); owned exclusively by the scheduler's driver task.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub peer_id: PeerId,
    pub bytes_transferred: u64,
    pub chunks_delivered: u64,
    pub last_transport: Option<crate::endpoint::TransportMethod>,
    /// EWMA of throughput in bytes/sec, alpha = [`EWMA_ALPHA`].
    pub ewma_bytes_per_sec: f64,
    pub last_chunk_completed_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub active: bool,
}

impl PeerStats {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            bytes_transferred: 0,
            chunks_delivered: 0,
            last_transport: None,
            ewma_bytes_per_sec: 0.0,
            last_chunk_completed_at: None,
            consecutive_failures: 0,
            active: true,
        }
    }

    /// Record a successfully delivered chunk of `bytes` taking `elapsed_secs`
    /// seconds and update the throughput EWMA.
    pub fn record_success(&mut self, bytes: u64, elapsed_secs: f64, transport: crate::endpoint::TransportMethod) {
        self.bytes_transferred += bytes;
        self.chunks_delivered += 1;
        self.consecutive_failures = 0;
        self.last_transport = Some(transport);
        self.last_chunk_completed_at = Some(Instant::now());
        if elapsed_secs > 0.0 {
            let instantaneous = bytes as f64 / elapsed_secs;
            self.ewma_bytes_per_sec =
                EWMA_ALPHA * instantaneous + (1.0 - EWMA_ALPHA) * self.ewma_bytes_per_sec;
        }
    }

    /// Record a failed chunk attempt. Returns true if the peer just crossed
    /// the deactivation threshold (3 consecutive failures, per spec §4.9).
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= 3 && self.active {
            self.active = false;
            return true;
        }
        false
    }

    pub fn reactivate(&mut self) {
        self.active = true;
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::TransportMethod;

    #[test]
    fn ewma_updates_toward_instantaneous() {
        let mut s = PeerStats::new(PeerId::new("a"));
        s.record_success(1000, 1.0, TransportMethod::ReliableStream);
        assert!((s.ewma_bytes_per_sec - 300.0).abs() < 1e-9);
        s.record_success(1000, 1.0, TransportMethod::ReliableStream);
        // 0.3*1000 + 0.7*300 = 510
        assert!((s.ewma_bytes_per_sec - 510.0).abs() < 1e-9);
    }

    #[test]
    fn three_consecutive_failures_deactivates() {
        let mut s = PeerStats::new(PeerId::new("a"));
        assert!(!s.record_failure());
        assert!(!s.record_failure());
        assert!(s.record_failure());
        assert!(!s.active);
    }

    #[test]
    fn success_resets_failure_count() {
        let mut s = PeerStats::new(PeerId::new("a"));
        s.record_failure();
        s.record_failure();
        s.record_success(10, 1.0, TransportMethod::Datagram);
        assert_eq!(s.consecutive_failures, 0);
    }

    #[test]
    fn reactivate_clears_failures_and_sets_active() {
        let mut s = PeerStats::new(PeerId::new("a"));
        s.record_failure();
        s.record_failure();
        s.record_failure();
        assert!(!s.active);
        s.reactivate();
        assert!(s.active);
        assert_eq!(s.consecutive_failures, 0);
    }
}
