use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use loom_core::error::{LoomError, Result};
use loom_core::traits::{MessageBroker, Subscription};

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>>;

struct Topic {
    tx: Option<mpsc::UnboundedSender<Value>>,
    rx: SharedReceiver,
}

impl Topic {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

/// In-process broker: one unbounded FIFO queue per topic.
///
/// Subscribers of the same topic compete for messages, so each event is
/// delivered once. Events published before anyone subscribes are kept.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, Topic>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_topic<T>(&self, topic: &str, f: impl FnOnce(&mut Topic) -> T) -> T {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        f(topics.entry(topic.to_string()).or_insert_with(Topic::new))
    }

    /// Stop accepting events on `topic`. Subscribers drain what is queued
    /// and then see the end of the stream.
    pub fn close_topic(&self, topic: &str) {
        self.with_topic(topic, |t| t.tx = None);
    }
}

impl MessageBroker for InMemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    fn send(&self, topic: &str, event: Value) -> BoxFuture<'_, Result<()>> {
        let result = self.with_topic(topic, |t| match &t.tx {
            Some(tx) => tx
                .send(event)
                .map_err(|_| LoomError::BrokerUnavailable(format!("topic {topic} has no queue"))),
            None => Err(LoomError::BrokerUnavailable(format!("topic {topic} is closed"))),
        });
        if result.is_ok() {
            debug!(topic, "Event queued");
        }
        Box::pin(async move { result })
    }

    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<Box<dyn Subscription>>> {
        let rx = self.with_topic(topic, |t| t.rx.clone());
        let sub: Box<dyn Subscription> = Box::new(MemorySubscription {
            topic: topic.to_string(),
            rx,
        });
        Box::pin(async move { Ok(sub) })
    }
}

struct MemorySubscription {
    topic: String,
    rx: SharedReceiver,
}

impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Value>>> {
        Box::pin(async move { Ok(self.rx.lock().await.recv().await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fifo_per_topic() {
        let broker = InMemoryBroker::new();
        for i in 0..5 {
            broker.send("jobs", json!({ "n": i })).await.unwrap();
        }
        broker.send("other", json!("x")).await.unwrap();

        let mut sub = broker.subscribe("jobs").await.unwrap();
        for i in 0..5 {
            assert_eq!(sub.recv().await.unwrap(), Some(json!({ "n": i })));
        }
        let mut other = broker.subscribe("other").await.unwrap();
        assert_eq!(other.recv().await.unwrap(), Some(json!("x")));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("jobs").await.unwrap();
        broker.send("jobs", json!(1)).await.unwrap();
        broker.close_topic("jobs");

        assert!(broker.send("jobs", json!(2)).await.is_err());
        assert_eq!(sub.recv().await.unwrap(), Some(json!(1)));
        assert_eq!(sub.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_producers() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut handles = Vec::new();
        for p in 0..4 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    broker.send("jobs", json!([p, i])).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut sub = broker.subscribe("jobs").await.unwrap();
        let mut last = [-1i64; 4];
        for _ in 0..100 {
            let event = sub.recv().await.unwrap().unwrap();
            let (p, i) = (event[0].as_u64().unwrap() as usize, event[1].as_i64().unwrap());
            assert!(i > last[p], "producer {p} out of order");
            last[p] = i;
        }
    }
}
