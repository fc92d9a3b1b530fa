//! Collision-proof event identifiers for agent results
//!
//! The exactly-once pipeline keys its Redis dedup set on a deterministic
//! digest of the fields that make a delivery unique. Re-deliveries of the
//! same result hash to the same id; a retry attempt (new `created_at`) or a
//! different producing worker hashes to a new one.

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use uuid::Uuid;

/// Length of the hex-truncated digest
const EVENT_ID_LEN: usize = 12;

/// Compute the dedup key for an agent result delivery
///
/// `sha1(task_id | stage | created_at | worker_id)` truncated to 12 hex
/// characters. Deterministic for identical inputs.
pub fn event_id(task_id: Uuid, stage: &str, created_at: DateTime<Utc>, worker_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(task_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(stage.as_bytes());
    hasher.update(b"|");
    hasher.update(created_at.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(worker_id.as_bytes());

    let digest = hasher.finalize();
    let mut id = hex::encode(digest);
    id.truncate(EVENT_ID_LEN);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_deterministic() {
        let task_id = Uuid::parse_str("0190b5a8-4c2e-7000-8000-000000000001").unwrap();
        let a = event_id(task_id, "scaffolding", fixed_time(), "worker-1");
        let b = event_id(task_id, "scaffolding", fixed_time(), "worker-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_distinct_when_any_input_differs() {
        let task_id = Uuid::now_v7();
        let base = event_id(task_id, "scaffolding", fixed_time(), "worker-1");

        assert_ne!(
            base,
            event_id(Uuid::now_v7(), "scaffolding", fixed_time(), "worker-1")
        );
        assert_ne!(base, event_id(task_id, "validation", fixed_time(), "worker-1"));
        assert_ne!(
            base,
            event_id(
                task_id,
                "scaffolding",
                fixed_time() + chrono::Duration::seconds(1),
                "worker-1"
            )
        );
        assert_ne!(base, event_id(task_id, "scaffolding", fixed_time(), "worker-2"));
    }
}
