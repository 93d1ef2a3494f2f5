//! In-process reference implementation of the bus contract.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use super::{MessageBus, Subscription};
use crate::core::errors::Result;

/// Per-topic subscriber fan-out over tokio mpsc channels.
///
/// Messages published to a topic with no subscribers are dropped, matching
/// broker semantics without retained messages.
#[derive(Debug)]
pub struct MemoryBus {
    topics: DashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
    capacity: usize,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        // clone the sender list out so no map guard is held across an await
        let senders: Vec<mpsc::Sender<Vec<u8>>> = match self.topics.get(topic) {
            Some(subscribers) => subscribers.iter().cloned().collect(),
            None => return Ok(()),
        };
        trace!(topic = %topic, subscribers = senders.len(), bytes = payload.len(), "publish");
        for sender in senders {
            // a gone subscriber is not a publish failure
            let _ = sender.send(payload.to_vec()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subscribers = self.topics.entry(topic.to_string()).or_default();
        subscribers.retain(|sender| !sender.is_closed());
        subscribers.push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = MemoryBus::default();
        let mut first = bus.subscribe("status").await.unwrap();
        let mut second = bus.subscribe("status").await.unwrap();

        bus.publish("status", b"running").await.unwrap();

        assert_eq!(first.recv().await.unwrap(), b"running");
        assert_eq!(second.recv().await.unwrap(), b"running");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = MemoryBus::default();
        bus.publish("nobody", b"lost").await.unwrap();

        // late subscriber sees only what is published after it joined
        let mut sub = bus.subscribe("nobody").await.unwrap();
        bus.publish("nobody", b"seen").await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), b"seen");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = MemoryBus::default();
        let mut stdout = bus.subscribe("stdout").await.unwrap();
        bus.publish("stderr", b"oops").await.unwrap();
        bus.publish("stdout", b"ok").await.unwrap();
        assert_eq!(stdout.recv().await.unwrap(), b"ok");
    }
}
