//! Shared error types for contract violations

use thiserror::Error;

/// Input does not satisfy a contract; surfaced to the caller, never retried
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("{0}")]
    Invalid(String),
}

/// A bus message fails its schema; dropped after an error log
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
