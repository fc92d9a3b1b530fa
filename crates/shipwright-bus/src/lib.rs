//! Message bus and KV/lock ports
//!
//! Two ports live here. [`MessageBus`] is topic publish/subscribe with an
//! optional durable stream mirror and consumer-group subscriptions.
//! [`KvStore`] is the hash/set/TTL primitive surface the exactly-once
//! pipeline builds its dedup sets and distributed locks on.
//!
//! Both have a Redis implementation for production and an in-memory
//! implementation for tests, mirroring how the storage port pairs Postgres
//! with memory.

mod bus;
mod error;
mod kv;
mod lock;
mod memory;
mod redis_bus;
mod redis_kv;

pub use bus::{BusMessage, MessageBus, Subscription};
pub use error::{BusError, KvError};
pub use kv::KvStore;
pub use lock::{LockToken, TaskLock};
pub use memory::{InMemoryBus, InMemoryKv};
pub use redis_bus::RedisBus;
pub use redis_kv::RedisKv;
