//! MessageBus port definition

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::BusError;

/// A message delivered to a subscriber
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A live subscription
///
/// Messages arrive on an internal channel fed by a background task; dropping
/// the subscription (or calling [`Subscription::close`]) stops the task.
pub struct Subscription {
    receiver: mpsc::Receiver<BusMessage>,
    driver: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(receiver: mpsc::Receiver<BusMessage>, driver: Option<JoinHandle<()>>) -> Self {
        Self { receiver, driver }
    }

    /// Receive the next message; `None` once the subscription is closed
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Stop the background reader and drain nothing further
    pub fn close(mut self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
    }
}

/// Topic publish/subscribe with an optional durable stream mirror
///
/// # Ordering
///
/// Publishes with the same `routing_key` are delivered in publish order; no
/// ordering holds across keys. Implementations achieve this by serializing
/// publishes through a single connection per publisher.
///
/// # Delivery
///
/// Group subscriptions are at-least-once: a consumer that dies before
/// acknowledging sees the message again on restart. Callers that need
/// exactly-once semantics must deduplicate downstream.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish to a topic; returns the number of live subscribers that
    /// received the message (0 is not an error, callers may warn).
    async fn publish(&self, topic: &str, routing_key: &str, payload: &[u8])
        -> Result<u64, BusError>;

    /// Publish and mirror to a durable stream for replay.
    ///
    /// The mirror is appended before the live publish so a group consumer
    /// can never observe a live message missing from the stream.
    async fn publish_durable(
        &self,
        topic: &str,
        stream: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64, BusError>;

    /// Durable consumer-group subscription over the topic's mirror stream.
    ///
    /// All consumers sharing `group` split the message flow; each message is
    /// delivered to exactly one group member (and re-delivered if that
    /// member dies without acknowledging).
    async fn subscribe_group(&self, stream: &str, group: &str) -> Result<Subscription, BusError>;

    /// Ephemeral pub/sub subscription; messages published while no
    /// subscriber is attached are lost.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}
