use crate::types::EngineEvent;

/// Event bus using tokio broadcast channel.
/// Every subscriber sees every engine event published after it subscribed.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::RunStarted {
            execution_id: "e1".into(),
            workflow_id: "wf".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "run_started");
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::BatchStarted {
            execution_id: "e1".into(),
            index: 0,
            steps: vec![],
        });
    }
}
