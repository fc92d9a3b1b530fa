//! In-memory implementations of the bus and KV ports for testing
//!
//! Same observable semantics as the Redis implementations: keyed publish
//! order, group subscriptions that split the flow and replay backlog, lazy
//! TTL expiry on reads.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
// tokio's Instant respects time pausing in tests
use tokio::time::Instant;

use crate::bus::{BusMessage, MessageBus, Subscription};
use crate::error::{BusError, KvError};
use crate::kv::KvStore;

const CHANNEL_CAPACITY: usize = 256;

struct GroupState {
    cursor: usize,
    subscribers: Vec<mpsc::Sender<BusMessage>>,
}

struct StreamState {
    entries: Vec<Vec<u8>>,
    groups: HashMap<String, GroupState>,
}

/// In-memory message bus
#[derive(Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
    streams: Mutex<HashMap<String, StreamState>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries mirrored to a stream (test observability)
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    fn fan_out(subscribers: &mut Vec<mpsc::Sender<BusMessage>>, message: &BusMessage) -> u64 {
        subscribers.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in subscribers.iter() {
            if tx.try_send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver stream backlog to exactly one live member per group
    fn drain_stream(stream_name: &str, state: &mut StreamState) {
        let StreamState { entries, groups } = state;
        for group in groups.values_mut() {
            group.subscribers.retain(|tx| !tx.is_closed());
            while group.cursor < entries.len() {
                let message = BusMessage {
                    topic: stream_name.to_string(),
                    payload: entries[group.cursor].clone(),
                };
                let Some(tx) = group.subscribers.first() else {
                    break;
                };
                if tx.try_send(message).is_err() {
                    break;
                }
                group.cursor += 1;
            }
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        _routing_key: &str,
        payload: &[u8],
    ) -> Result<u64, BusError> {
        let message = BusMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        let mut topics = self.topics.lock();
        let subscribers = topics.entry(topic.to_string()).or_default();
        Ok(Self::fan_out(subscribers, &message))
    }

    async fn publish_durable(
        &self,
        topic: &str,
        stream: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64, BusError> {
        {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream.to_string()).or_insert_with(|| StreamState {
                entries: Vec::new(),
                groups: HashMap::new(),
            });
            state.entries.push(payload.to_vec());
            Self::drain_stream(stream, state);
        }
        self.publish(topic, routing_key, payload).await
    }

    async fn subscribe_group(&self, stream: &str, group: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_insert_with(|| StreamState {
            entries: Vec::new(),
            groups: HashMap::new(),
        });
        // New groups start at the tail, matching XGROUP CREATE $
        let tail = state.entries.len();
        let group_state = state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                cursor: tail,
                subscribers: Vec::new(),
            });
        group_state.subscribers.push(tx);
        Self::drain_stream(stream, state);

        Ok(Subscription::new(rx, None))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.topics.lock().entry(topic.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx, None))
    }
}

enum Entry {
    Str(String),
    Set(std::collections::HashSet<String>),
    Hash(HashMap<String, String>),
}

struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn alive(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

/// In-memory KV store
#[derive(Default)]
pub struct InMemoryKv {
    slots: Mutex<HashMap<String, Slot>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(slots: &mut HashMap<String, Slot>, key: &str) {
        if slots.get(key).is_some_and(|s| !s.alive()) {
            slots.remove(key);
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut slots = self.slots.lock();
        Self::prune(&mut slots, key);
        if slots.contains_key(key) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut slots = self.slots.lock();
        Self::prune(&mut slots, key);
        match slots.get(key) {
            Some(Slot {
                entry: Entry::Str(current),
                ..
            }) if current == value => {
                slots.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sadd_with_ttl(&self, key: &str, member: &str, ttl: Duration) -> Result<(), KvError> {
        let mut slots = self.slots.lock();
        Self::prune(&mut slots, key);
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::Set(Default::default()),
            expires_at: None,
        });
        if let Entry::Set(members) = &mut slot.entry {
            members.insert(member.to_string());
        }
        slot.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut slots = self.slots.lock();
        Self::prune(&mut slots, key);
        Ok(match slots.get(key) {
            Some(Slot {
                entry: Entry::Set(members),
                ..
            }) => members.contains(member),
            _ => false,
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut slots = self.slots.lock();
        Self::prune(&mut slots, key);
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::Hash(HashMap::new()),
            expires_at: None,
        });
        if let Entry::Hash(fields) = &mut slot.entry {
            fields.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut slots = self.slots.lock();
        Self::prune(&mut slots, key);
        Ok(match slots.get(key) {
            Some(Slot {
                entry: Entry::Hash(fields),
                ..
            }) => fields.get(field).cloned(),
            _ => None,
        })
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, KvError> {
        let mut slots = self.slots.lock();
        Self::prune(&mut slots, key);
        Ok(match slots.get(key) {
            Some(Slot {
                entry: Entry::Hash(fields),
                ..
            }) => fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => Vec::new(),
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError> {
        let mut slots = self.slots.lock();
        if let Some(Slot {
            entry: Entry::Hash(fields),
            ..
        }) = slots.get_mut(key)
        {
            fields.remove(field);
        }
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut slots = self.slots.lock();
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut slots = self.slots.lock();
        Self::prune(&mut slots, key);
        Ok(match slots.get(key) {
            Some(Slot {
                entry: Entry::Str(value),
                ..
            }) => Some(value.clone()),
            _ => None,
        })
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.slots.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_counts_live_subscribers() {
        let bus = InMemoryBus::new();

        let received = bus.publish("workflow:events", "wf-1", b"hello").await.unwrap();
        assert_eq!(received, 0);

        let mut sub = bus.subscribe("workflow:events").await.unwrap();
        let received = bus.publish("workflow:events", "wf-1", b"hello").await.unwrap();
        assert_eq!(received, 1);

        let msg = sub.next().await.expect("should receive");
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn test_durable_publish_mirrors_to_stream() {
        let bus = InMemoryBus::new();
        bus.publish_durable("agent:scaffold:tasks", "stream:agent:scaffold:tasks", "wf-1", b"a")
            .await
            .unwrap();
        bus.publish_durable("agent:scaffold:tasks", "stream:agent:scaffold:tasks", "wf-1", b"b")
            .await
            .unwrap();
        assert_eq!(bus.stream_len("stream:agent:scaffold:tasks"), 2);
    }

    #[tokio::test]
    async fn test_group_subscription_gets_messages_in_order() {
        let bus = InMemoryBus::new();
        let mut sub = bus
            .subscribe_group("stream:orchestrator:results", "orchestrator-core")
            .await
            .unwrap();

        for payload in [b"one".as_slice(), b"two", b"three"] {
            bus.publish_durable(
                "orchestrator:results",
                "stream:orchestrator:results",
                "wf-1",
                payload,
            )
            .await
            .unwrap();
        }

        assert_eq!(sub.next().await.unwrap().payload, b"one");
        assert_eq!(sub.next().await.unwrap().payload, b"two");
        assert_eq!(sub.next().await.unwrap().payload, b"three");
    }

    #[tokio::test]
    async fn test_new_group_starts_at_tail() {
        let bus = InMemoryBus::new();
        bus.publish_durable("t", "stream:t", "k", b"old").await.unwrap();

        let mut sub = bus.subscribe_group("stream:t", "g").await.unwrap();
        bus.publish_durable("t", "stream:t", "k", b"new").await.unwrap();

        assert_eq!(sub.next().await.unwrap().payload, b"new");
    }

    #[tokio::test]
    async fn test_kv_ttl_expiry() {
        tokio::time::pause();
        let kv = InMemoryKv::new();

        assert!(kv
            .set_nx_px("lock:task:x", "token", Duration::from_millis(50))
            .await
            .unwrap());
        assert!(!kv
            .set_nx_px("lock:task:x", "other", Duration::from_millis(50))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_millis(60)).await;

        assert!(kv
            .set_nx_px("lock:task:x", "other", Duration::from_millis(50))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_kv_set_membership() {
        let kv = InMemoryKv::new();
        kv.sadd_with_ttl("seen:t", "abc", Duration::from_secs(60)).await.unwrap();
        assert!(kv.sismember("seen:t", "abc").await.unwrap());
        assert!(!kv.sismember("seen:t", "def").await.unwrap());
        assert!(!kv.sismember("seen:other", "abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_kv_hash_ops() {
        let kv = InMemoryKv::new();
        kv.hset("agents:registry", "a1", "{}").await.unwrap();
        kv.hset("agents:registry", "a2", "{}").await.unwrap();
        assert_eq!(kv.hget("agents:registry", "a1").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(kv.hgetall("agents:registry").await.unwrap().len(), 2);
        kv.hdel("agents:registry", "a1").await.unwrap();
        assert_eq!(kv.hget("agents:registry", "a1").await.unwrap(), None);
    }
}
