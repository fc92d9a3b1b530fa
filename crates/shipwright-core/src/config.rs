//! Runtime configuration loaded from the environment

use std::time::Duration;

use uuid::Uuid;

/// Orchestrator process configuration
///
/// Values come from the environment (`.env` supported via dotenvy at the
/// binary seam); everything except the connection URLs has a working default.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub database_url: String,
    pub redis_url: String,

    /// Identity recorded in truth-table logs and lock tokens
    pub worker_id: String,

    /// Per-task distributed lock TTL
    pub lock_ttl: Duration,

    /// TTL on `seen:{task_id}` dedup sets
    pub dedup_ttl: Duration,

    /// Wait-for-transition polling: attempts x interval
    pub transition_poll_attempts: u32,
    pub transition_poll_interval: Duration,

    /// Scheduler tick interval
    pub scheduler_tick: Duration,

    /// Per-event subscription timeout for event-triggered jobs
    pub event_subscribe_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/shipwright".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            worker_id: format!("orchestrator-{}", Uuid::new_v4().simple()),
            lock_ttl: Duration::from_millis(5_000),
            dedup_ttl: Duration::from_secs(48 * 3600),
            transition_poll_attempts: 50,
            transition_poll_interval: Duration::from_millis(100),
            scheduler_tick: Duration::from_secs(1),
            event_subscribe_timeout: Duration::from_secs(3),
        }
    }
}

impl OrchestratorConfig {
    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            lock_ttl: env_millis("TASK_LOCK_TTL_MS").unwrap_or(defaults.lock_ttl),
            dedup_ttl: env_secs("DEDUP_TTL_SECS").unwrap_or(defaults.dedup_ttl),
            transition_poll_attempts: env_u32("TRANSITION_POLL_ATTEMPTS")
                .unwrap_or(defaults.transition_poll_attempts),
            transition_poll_interval: env_millis("TRANSITION_POLL_INTERVAL_MS")
                .unwrap_or(defaults.transition_poll_interval),
            scheduler_tick: env_millis("SCHEDULER_TICK_MS").unwrap_or(defaults.scheduler_tick),
            event_subscribe_timeout: env_millis("EVENT_SUBSCRIBE_TIMEOUT_MS")
                .unwrap_or(defaults.event_subscribe_timeout),
        }
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_millis(key: &str) -> Option<Duration> {
    Some(Duration::from_millis(std::env::var(key).ok()?.parse().ok()?))
}

fn env_secs(key: &str) -> Option<Duration> {
    Some(Duration::from_secs(std::env::var(key).ok()?.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.lock_ttl, Duration::from_millis(5_000));
        assert_eq!(config.dedup_ttl, Duration::from_secs(172_800));
        assert_eq!(config.transition_poll_attempts, 50);
        assert_eq!(config.transition_poll_interval, Duration::from_millis(100));
        assert!(config.worker_id.starts_with("orchestrator-"));
    }
}
