//! Per-task distributed locking on top of the KV port
//!
//! The lock is a TTL'd string key holding a random token. Acquire is
//! set-if-absent; release is compare-and-delete on the token, so a holder
//! whose TTL expired can never delete the lock a successor acquired.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use crate::error::KvError;
use crate::kv::KvStore;

/// Opaque token identifying one acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        let nonce: u64 = rand::thread_rng().gen();
        Self(format!("{}-{nonce:016x}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Handle to a held per-task lock
///
/// Not an RAII guard: release is an async KV round trip, so callers release
/// explicitly. A lock that is never released self-expires via its TTL.
pub struct TaskLock {
    kv: Arc<dyn KvStore>,
    key: String,
    token: LockToken,
}

impl TaskLock {
    /// Try to acquire `key` for `ttl`. Returns `None` when another worker
    /// holds it.
    pub async fn acquire(
        kv: Arc<dyn KvStore>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Result<Option<Self>, KvError> {
        let key = key.into();
        let token = LockToken::generate();

        if kv.set_nx_px(&key, token.as_str(), ttl).await? {
            Ok(Some(Self { kv, key, token }))
        } else {
            Ok(None)
        }
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Release the lock. Returns false when the TTL already expired and the
    /// key is gone or owned by someone else; that is logged, not an error.
    pub async fn release(self) -> Result<bool, KvError> {
        let released = self
            .kv
            .compare_and_delete(&self.key, self.token.as_str())
            .await?;
        if !released {
            warn!(key = %self.key, "lock expired before release; a successor may hold it");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryKv;

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());

        let first = TaskLock::acquire(kv.clone(), "lock:task:a", Duration::from_secs(5))
            .await
            .expect("should not error")
            .expect("should acquire");

        let second = TaskLock::acquire(kv.clone(), "lock:task:a", Duration::from_secs(5))
            .await
            .expect("should not error");
        assert!(second.is_none());

        assert!(first.release().await.expect("should release"));

        let third = TaskLock::acquire(kv, "lock:task:a", Duration::from_secs(5))
            .await
            .expect("should not error");
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_release_only_deletes_own_token() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());

        let lock = TaskLock::acquire(kv.clone(), "lock:task:b", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        // Simulate TTL expiry plus a successor's acquisition
        kv.del("lock:task:b").await.unwrap();
        kv.set_nx_px("lock:task:b", "someone-else", Duration::from_secs(5))
            .await
            .unwrap();

        // Stale holder must not delete the successor's lock
        assert!(!lock.release().await.unwrap());
        assert_eq!(
            kv.get("lock:task:b").await.unwrap().as_deref(),
            Some("someone-else")
        );
    }
}
