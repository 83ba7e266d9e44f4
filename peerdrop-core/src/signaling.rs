//! Abstract signaling channel (spec §6 "Relayed transport"): a hierarchical
//! key-value publish/subscribe service used for rendezvous (hole-punch
//! coordination, C4) and as the relayed/signaled-fallback transport's
//! message bus. No concrete backend is mandated by the spec; per design note
//! "Global dc module. Replace by a capability object injected into the
//! orchestrator", callers inject whatever implements this trait.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

/// A rendezvous/message bus keyed by hierarchical topics such as
/// `hosts/<host_id>/messages/<client_id>` or `hosts/<host_id>/ice/<punch_id>`.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Publish a JSON value under `topic`. Fire-and-forget: delivery is
    /// best-effort to whoever is currently subscribed.
    async fn publish(&self, topic: &str, value: Value);

    /// Subscribe to all values published under `topic` from now on.
    async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value>;
}

/// In-memory implementation backed by per-topic broadcast channels. Used by
/// tests and by embedders with no real signaling service — the engine itself
/// never assumes a particular backend.
pub struct InMemorySignaling {
    topics: tokio::sync::Mutex<std::collections::HashMap<String, broadcast::Sender<Value>>>,
    capacity: usize,
}

impl InMemorySignaling {
    pub fn new() -> Self {
        Self {
            topics: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            capacity: 64,
        }
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<Value> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemorySignaling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingChannel for InMemorySignaling {
    async fn publish(&self, topic: &str, value: Value) {
        let tx = self.sender_for(topic).await;
        let _ = tx.send(value);
    }

    async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.sender_for(topic).await.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_then_subscribe_same_topic_round_trips() {
        let chan = InMemorySignaling::new();
        let mut rx = chan.subscribe("hosts/h1/messages").await;
        chan.publish("hosts/h1/messages", json!({"hello": "world"}))
            .await;
        let got = rx.recv().await.unwrap();
        assert_eq!(got["hello"], "world");
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let chan = InMemorySignaling::new();
        let mut rx_a = chan.subscribe("a").await;
        chan.publish("b", json!(1)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let chan = InMemorySignaling::new();
        let mut rx1 = chan.subscribe("t").await;
        let mut rx2 = chan.subscribe("t").await;
        chan.publish("t", json!("x")).await;
        assert_eq!(rx1.recv().await.unwrap(), json!("x"));
        assert_eq!(rx2.recv().await.unwrap(), json!("x"));
    }
}
