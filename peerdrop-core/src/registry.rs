//! Connection registry (C7, spec §4.7): persists the transport method and
//! endpoint that last succeeded per peer, consulted by the orchestrator (C5)
//! on its next attempt. Not part of correctness — the orchestrator must work
//! with an empty registry.
//!
//! Grounded on the teacher's atomic-persistence idiom (write to a temp file,
//! then rename over the target) generalized from single-file config loading
//! to a small JSON table keyed by the stable peer identifier (§9 open
//! question: never by transient endpoint).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::endpoint::{Endpoint, TransportMethod};
use crate::peer::PeerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub method: TransportMethod,
    pub address: String,
    pub port: u16,
    pub last_success_at_unix_secs: u64,
}

/// A persistent `peer_id -> (method, address, port, last_success_at)` table,
/// guarded by a read-write lock per spec §5 (writes are infrequent; the
/// in-memory table is replaced copy-on-write, then persisted by atomic
/// rename).
pub struct ConnectionRegistry {
    path: Option<PathBuf>,
    table: RwLock<HashMap<PeerId, RegistryEntry>>,
}

impl ConnectionRegistry {
    /// An empty, in-memory-only registry. The orchestrator must work
    /// correctly against this (spec §4.7).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Load from `path` if it exists and parses; otherwise start empty.
    /// Future [`Self::put`] calls persist back to `path`.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Self {
            path: Some(path),
            table: RwLock::new(table),
        }
    }

    pub async fn get(&self, peer_id: &PeerId) -> Option<RegistryEntry> {
        self.table.read().await.get(peer_id).cloned()
    }

    pub async fn put(&self, peer_id: PeerId, endpoint: &Endpoint, now_unix_secs: u64) {
        {
            let mut table = self.table.write().await;
            table.insert(
                peer_id,
                RegistryEntry {
                    method: endpoint.method,
                    address: endpoint.address.clone(),
                    port: endpoint.port,
                    last_success_at_unix_secs: now_unix_secs,
                },
            );
        }
        self.persist().await;
    }

    pub async fn forget(&self, peer_id: &PeerId) {
        {
            let mut table = self.table.write().await;
            table.remove(peer_id);
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let snapshot = self.table.read().await.clone();
        let Ok(json) = serde_json::to_vec_pretty(&snapshot) else {
            return;
        };
        let tmp = path.with_extension("tmp");
        if tokio::fs::write(&tmp, &json).await.is_ok() {
            let _ = tokio::fs::rename(&tmp, path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_endpoint() -> Endpoint {
        Endpoint::new("10.0.0.5", 4000, TransportMethod::ReliableStream)
    }

    #[tokio::test]
    async fn empty_registry_returns_none() {
        let reg = ConnectionRegistry::in_memory();
        assert!(reg.get(&PeerId::new("p1")).await.is_none());
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let reg = ConnectionRegistry::in_memory();
        reg.put(PeerId::new("p1"), &sample_endpoint(), 1000).await;
        let entry = reg.get(&PeerId::new("p1")).await.unwrap();
        assert_eq!(entry.method, TransportMethod::ReliableStream);
        assert_eq!(entry.address, "10.0.0.5");
    }

    #[tokio::test]
    async fn forget_removes_entry() {
        let reg = ConnectionRegistry::in_memory();
        reg.put(PeerId::new("p1"), &sample_endpoint(), 1000).await;
        reg.forget(&PeerId::new("p1")).await;
        assert!(reg.get(&PeerId::new("p1")).await.is_none());
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let reg = ConnectionRegistry::load(&path).await;
        reg.put(PeerId::new("p1"), &sample_endpoint(), 42).await;

        let reloaded = ConnectionRegistry::load(&path).await;
        let entry = reloaded.get(&PeerId::new("p1")).await.unwrap();
        assert_eq!(entry.port, 4000);
        assert_eq!(entry.last_success_at_unix_secs, 42);
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let reg = ConnectionRegistry::load(&path).await;
        assert!(reg.get(&PeerId::new("p1")).await.is_none());
    }
}
