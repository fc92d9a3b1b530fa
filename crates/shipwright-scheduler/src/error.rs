//! Scheduler error type

use thiserror::Error;
use uuid::Uuid;

use shipwright_core::ValidationError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no handler registered under {0:?}")]
    HandlerNotFound(String),

    #[error("no gateway configured for {0} handlers")]
    GatewayMissing(&'static str),

    #[error("job {0} is cancelled")]
    JobCancelled(Uuid),

    #[error(transparent)]
    Store(#[from] shipwright_storage::StoreError),

    #[error(transparent)]
    Bus(#[from] shipwright_bus::BusError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
