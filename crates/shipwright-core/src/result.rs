//! Agent result wire contract and schema validation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchemaError;
use crate::task::AgentType;

/// Completion report published by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    /// Identifier of the producing agent process
    pub agent_id: String,

    pub agent_type: AgentType,
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub success: bool,

    /// Agent-reported status string ("completed", "failed", ...)
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub timestamp: DateTime<Utc>,
}

/// Transport wrapper on `orchestrator:results`
///
/// Carries `workflow_id` and `stage` redundantly for routing so the
/// orchestrator can run the stage-mismatch gate without unwrapping the body
/// first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub workflow_id: Uuid,
    pub stage: String,
    pub result: AgentResult,
}

impl ResultEnvelope {
    /// Parse and schema-check a raw bus message
    ///
    /// Schema-violating messages are fatal for the delivery: the caller logs
    /// and acknowledges without re-delivery.
    pub fn parse(bytes: &[u8]) -> Result<Self, SchemaError> {
        let envelope: Self = serde_json::from_slice(bytes)?;

        if envelope.stage.is_empty() {
            return Err(SchemaError::MissingField("stage"));
        }
        if envelope.result.agent_id.is_empty() {
            return Err(SchemaError::MissingField("result.agent_id"));
        }
        if envelope.workflow_id != envelope.result.workflow_id {
            return Err(SchemaError::MissingField("result.workflow_id"));
        }

        Ok(envelope)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
