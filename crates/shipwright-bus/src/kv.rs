//! KvStore port definition

use std::time::Duration;

use async_trait::async_trait;

use crate::error::KvError;

/// Hash/set primitives, TTL'd string ops, and atomic set-if-absent
///
/// Multi-step interactions (probe-then-set, acquire-work-release) are not
/// atomic at this surface; callers use [`KvStore::set_nx_px`] and
/// [`KvStore::compare_and_delete`] for the atomic steps and keep everything
/// else idempotent.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// SET key value NX PX ttl - returns true when the key was absent and is
    /// now owned by the caller.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Delete `key` only if it still holds `value` (script-atomic on Redis).
    /// Returns true when the delete happened.
    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, KvError>;

    /// Add a member to a set and refresh the set's TTL in one atomic step.
    async fn sadd_with_ttl(&self, key: &str, member: &str, ttl: Duration) -> Result<(), KvError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, KvError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), KvError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;
}
