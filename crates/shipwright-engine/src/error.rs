//! Engine error taxonomy
//!
//! Maps one-to-one onto the propagation policy: validation and not-found
//! surface to callers; schema, stale, and conflict are drop-after-log inside
//! the result pipeline; dispatch failures feed STAGE_FAILED into the FSM.

use thiserror::Error;
use uuid::Uuid;

use shipwright_core::{AgentType, SchemaError, ValidationError};

use crate::fsm::FsmError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Input does not satisfy a contract; surfaced, never retried
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Bus message failed its schema; dropped after error-log
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Result stage does not match the workflow's persisted stage
    #[error("stale result for workflow {workflow_id}: result stage {result_stage:?}, workflow at {current_stage:?}")]
    StaleResult {
        workflow_id: Uuid,
        result_stage: String,
        current_stage: String,
    },

    /// CAS lost; the winning worker continues
    #[error("transition conflict for workflow {0}: another worker advanced it")]
    Conflict(Uuid),

    /// Publish to an agent topic failed; propagates STAGE_FAILED
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    /// Required upstream output absent for a payload that mandates it
    #[error("missing upstream output {stage:?} for {agent_type} payload")]
    MissingUpstreamOutput { stage: String, agent_type: AgentType },

    /// Operation on a workflow already in a terminal state
    #[error("workflow {0} is in a terminal state")]
    Terminal(Uuid),

    #[error(transparent)]
    Fsm(#[from] FsmError),

    #[error(transparent)]
    Store(#[from] shipwright_storage::StoreError),

    #[error(transparent)]
    Bus(#[from] shipwright_bus::BusError),

    #[error(transparent)]
    Kv(#[from] shipwright_bus::KvError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
