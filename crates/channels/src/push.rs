//! Push channel: routing-key pub/sub between push producers and the relay.

use std::pin::Pin;

use {
    async_trait::async_trait,
    dashmap::DashMap,
    futures::{Stream, StreamExt},
    tokio::sync::broadcast,
    tokio_stream::wrappers::BroadcastStream,
    tracing::debug,
};

use crate::error::Result;

/// Stream of raw payloads published under one routing key.
pub type PushStream = Pin<Box<dyn Stream<Item = serde_json::Value> + Send>>;

/// Routing key for a backend-side conversation reference.
pub fn routing_key(reference: &str) -> String {
    format!("conversation_{reference}")
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn publish(&self, routing_key: &str, payload: serde_json::Value) -> Result<()>;

    async fn subscribe(&self, routing_key: &str) -> Result<PushStream>;
}

/// In-process push channel: one broadcast channel per routing key.
pub struct BroadcastPushChannel {
    topics: DashMap<String, broadcast::Sender<serde_json::Value>>,
    capacity: usize,
}

impl BroadcastPushChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, routing_key: &str) -> broadcast::Sender<serde_json::Value> {
        self.topics
            .entry(routing_key.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Drop topics nobody listens to any more.
    pub fn prune(&self) -> usize {
        let before = self.topics.len();
        self.topics.retain(|_, tx| tx.receiver_count() > 0);
        before - self.topics.len()
    }
}

impl Default for BroadcastPushChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl PushChannel for BroadcastPushChannel {
    async fn publish(&self, routing_key: &str, payload: serde_json::Value) -> Result<()> {
        let tx = self.sender(routing_key);
        // No receivers is not an error: the poll path is the backstop.
        if tx.send(payload).is_err() {
            debug!(routing_key, "push published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, routing_key: &str) -> Result<PushStream> {
        let rx = self.sender(routing_key).subscribe();
        let key = routing_key.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let key = key.clone();
            async move {
                match item {
                    Ok(value) => Some(value),
                    Err(e) => {
                        debug!(routing_key = %key, error = %e, "push subscriber lagged");
                        None
                    },
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
