use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;

/// Per-subscriber channel capacity. Slow subscribers lose messages once
/// their buffer fills; publishers are never backpressured.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Transport envelope delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed while publishing to {0}")]
    Closed(String),
}

/// Minimal broadcast interface consumed by the room manager.
///
/// Implementations must echo a publisher's own messages back on its own
/// subscriptions: the matcher drives room creation from the reconciliation
/// path, so every node (the publisher included) has to observe every event.
/// Delivery is best effort; dropped messages are not reported.
pub trait PubSub: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;
    fn subscribe(&self, topic: &str) -> Subscription;
}

/// Hook detaching a subscription from its bus; runs at most once.
pub type CancelFn = Box<dyn FnOnce() + Send>;

/// A handle on one topic subscription.
///
/// Dropping the subscription (or calling [`Subscription::cancel`]) detaches
/// it from the bus; deliveries after that point are silently discarded,
/// anything already buffered stays readable, and [`Subscription::recv`]
/// returns `None` once the buffer drains.
pub struct Subscription {
    rx: mpsc::Receiver<Message>,
    cancel: Option<CancelFn>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Message>, cancel: CancelFn) -> Self {
        Self {
            rx,
            cancel: Some(cancel),
        }
    }

    /// Receive the next message, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Detach from the bus. Buffered messages remain readable.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Process-local transport used for development, tests, and single-node
/// deployments. Fan-out is keyed by topic; every subscriber gets its own
/// bounded buffer and full buffers drop rather than stall the publisher.
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    inner: Arc<RwLock<FanoutTable>>,
}

#[derive(Default)]
struct FanoutTable {
    next_id: u64,
    closed: bool,
    subs: HashMap<String, HashMap<u64, mpsc::Sender<Message>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shut the bus down: existing subscriptions end once drained and
    /// further publishes fail with [`TransportError::Closed`].
    pub fn close(&self) {
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        table.closed = true;
        table.subs.clear();
    }
}

impl PubSub for MemoryPubSub {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            return Err(TransportError::Closed(topic.to_string()));
        }
        if let Some(subscribers) = table.subs.get(topic) {
            for tx in subscribers.values() {
                let msg = Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                };
                // Full or cancelled subscribers lose the message.
                let _ = tx.try_send(msg);
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut table = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            // Dropping the sender leaves a subscription that yields None.
            return Subscription::new(rx, Box::new(|| {}));
        }
        let id = table.next_id;
        table.next_id += 1;
        table
            .subs
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);
        drop(table);

        let inner = Arc::clone(&self.inner);
        let topic = topic.to_string();
        let cancel = Box::new(move || {
            let mut table = inner.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(by_topic) = table.subs.get_mut(&topic) {
                by_topic.remove(&id);
                if by_topic.is_empty() {
                    table.subs.remove(&topic);
                }
            }
        });
        Subscription::new(rx, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publisher_receives_own_messages() {
        let bus = MemoryPubSub::new();
        let mut sub = bus.subscribe("topic.a");

        bus.publish("topic.a", b"hello").unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic, "topic.a");
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let bus = MemoryPubSub::new();
        let mut sub_a = bus.subscribe("topic.a");
        let mut sub_b = bus.subscribe("topic.a");
        let mut other = bus.subscribe("topic.b");

        bus.publish("topic.a", b"ping").unwrap();

        assert_eq!(sub_a.recv().await.unwrap().payload, b"ping");
        assert_eq!(sub_b.recv().await.unwrap().payload, b"ping");

        bus.publish("topic.b", b"pong").unwrap();
        assert_eq!(other.recv().await.unwrap().payload, b"pong");
    }

    #[tokio::test]
    async fn single_publisher_order_preserved() {
        let bus = MemoryPubSub::new();
        let mut sub = bus.subscribe("topic.a");

        for i in 0..10u8 {
            bus.publish("topic.a", &[i]).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(sub.recv().await.unwrap().payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking() {
        let bus = MemoryPubSub::new();
        let mut sub = bus.subscribe("topic.a");

        // Overfill the buffer without draining; the overflow is dropped.
        for i in 0..(SUBSCRIBER_BUFFER + 8) {
            bus.publish("topic.a", &[(i % 256) as u8]).unwrap();
        }

        let mut received = 0;
        while sub.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn cancel_stops_delivery() {
        let bus = MemoryPubSub::new();
        let mut sub = bus.subscribe("topic.a");

        bus.publish("topic.a", b"before").unwrap();
        sub.cancel();
        bus.publish("topic.a", b"after").unwrap();

        // Already-buffered messages drain, later publishes never arrive.
        assert_eq!(sub.recv().await.unwrap().payload, b"before");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = MemoryPubSub::new();
        {
            let _sub = bus.subscribe("topic.a");
        }
        // No subscriber left; publish still succeeds.
        bus.publish("topic.a", b"nobody home").unwrap();
    }

    #[tokio::test]
    async fn close_ends_subscriptions_and_rejects_publish() {
        let bus = MemoryPubSub::new();
        let mut sub = bus.subscribe("topic.a");

        bus.publish("topic.a", b"last").unwrap();
        bus.close();

        assert_eq!(sub.recv().await.unwrap().payload, b"last");
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            bus.publish("topic.a", b"late"),
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn subscribe_after_close_yields_nothing() {
        let bus = MemoryPubSub::new();
        bus.close();
        let mut sub = bus.subscribe("topic.a");
        assert!(sub.recv().await.is_none());
    }
}
