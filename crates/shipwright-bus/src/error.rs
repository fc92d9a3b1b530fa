//! Port error types

use thiserror::Error;

/// Errors from the message bus port
#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Errors from the KV/lock port
#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
