//! Publish/subscribe abstraction and the in-memory broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;

const SUBSCRIPTION_BUFFER: usize = 1024;

/// A message as seen by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    /// Partition/ordering key, the aggregate id for outbox messages.
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Messages delivered to one subscriber.
pub struct Subscription {
    receiver: mpsc::Receiver<BrokerMessage>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<BrokerMessage>) -> Self {
        Self { receiver }
    }

    /// Next message, or `None` once the broker side is gone.
    pub async fn next(&mut self) -> Option<BrokerMessage> {
        self.receiver.recv().await
    }
}

/// At-least-once publish/subscribe transport.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>)
    -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;
}

#[derive(Default)]
struct BrokerState {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<BrokerMessage>>>>,
    published: Mutex<Vec<BrokerMessage>>,
    unavailable: AtomicBool,
    fail_next: AtomicUsize,
}

/// Broker that fans messages out to in-process subscribers.
///
/// Failure can be injected with [`InMemoryBroker::set_unavailable`] and
/// [`InMemoryBroker::fail_next`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish fails with [`BrokerError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails the next `count` publishes.
    pub fn fail_next(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    /// Every message accepted so far, in publish order.
    pub fn published(&self) -> Vec<BrokerMessage> {
        locked(&self.state.published).clone()
    }

    pub fn published_count(&self) -> usize {
        locked(&self.state.published).len()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("in-memory broker is down".to_string()));
        }
        let injected = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Publish("injected publish failure".to_string()));
        }

        let message = BrokerMessage {
            topic: topic.to_string(),
            key: Some(key.to_string()),
            payload,
        };
        locked(&self.state.published).push(message.clone());

        let senders = locked(&self.state.subscribers)
            .get(topic)
            .cloned()
            .unwrap_or_default();
        for sender in senders {
            // A dropped subscription is not a publish failure.
            let _ = sender.send(message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut subscribers = locked(&self.state.subscribers);
        let topic_subscribers = subscribers.entry(topic.to_string()).or_default();
        topic_subscribers.retain(|s| !s.is_closed());
        topic_subscribers.push(sender);
        Ok(Subscription::new(receiver))
    }
}
