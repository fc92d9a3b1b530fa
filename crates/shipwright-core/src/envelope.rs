//! The versioned wire contract from orchestrator to agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{AgentType, TaskPriority, TaskStatus};
use crate::workflow::WorkflowType;

/// Wire schema version stamped on every envelope
pub const ENVELOPE_VERSION: &str = "1.0.0";

/// Workflow context forwarded to agents
///
/// Carries prior stage outputs so downstream agents can consume upstream
/// results without a round trip to the orchestrator. Outputs only; task
/// payloads are never forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_type: WorkflowType,
    pub workflow_name: String,
    pub current_stage: String,
    pub stage_outputs: serde_json::Map<String, serde_json::Value>,
}

/// Agent-type-specific task payload
///
/// Closed sum over agent types; each variant carries its own payload record.
/// Adding a new agent type is an additive change here and in
/// [`crate::task::AgentType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentPayload {
    /// Project initialization and code generation
    Scaffold {
        /// "initialize" for the first stage, "scaffold" afterwards
        action: String,
        app_name: String,
        requirements: serde_json::Value,
        output_dir: String,
    },

    /// Static and semantic validation of generated sources
    Validation {
        /// Paths synthesized from the scaffolding output, or wildcard
        /// fallbacks rooted at the workflow output directory
        file_paths: Vec<String>,
        output_dir: String,
        strict: bool,
    },

    /// End-to-end scenario runs against a deployed preview
    E2e {
        base_url: Option<String>,
        scenarios: Vec<String>,
        output_dir: String,
    },

    /// Cross-service integration checks
    Integration {
        services: Vec<String>,
        output_dir: String,
    },

    /// Promotion of validated artifacts to an environment
    Deployment {
        environment: String,
        artifact_dir: String,
        dry_run: bool,
    },
}

impl AgentPayload {
    /// The agent pool this payload belongs to
    pub fn agent_type(&self) -> AgentType {
        match self {
            Self::Scaffold { .. } => AgentType::Scaffold,
            Self::Validation { .. } => AgentType::Validation,
            Self::E2e { .. } => AgentType::E2e,
            Self::Integration { .. } => AgentType::Integration,
            Self::Deployment { .. } => AgentType::Deployment,
        }
    }
}

/// The typed, versioned message carrying a task from orchestrator to agent
///
/// Serialized as JSON onto `agent:{agent_type}:tasks` with routing key
/// `workflow_id`, and mirrored to the durable stream for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEnvelope {
    pub id: Uuid,

    /// Always "task"
    #[serde(rename = "type")]
    pub message_type: String,

    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub stage: String,
    pub agent_type: AgentType,
    pub priority: TaskPriority,

    /// Always `pending` at dispatch
    pub status: TaskStatus,

    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub trace_id: Uuid,
    pub envelope_version: String,

    pub workflow_context: WorkflowContext,
    pub payload: AgentPayload,
}

impl AgentEnvelope {
    /// Serialize for the bus; failure here is a programming error surfaced
    /// to the dispatcher as fatal.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> AgentEnvelope {
        let mut outputs = serde_json::Map::new();
        outputs.insert(
            "scaffolding".to_string(),
            serde_json::json!({ "files_generated": ["src/main.rs", "Cargo.toml"] }),
        );

        AgentEnvelope {
            id: Uuid::now_v7(),
            message_type: "task".to_string(),
            workflow_id: Uuid::now_v7(),
            task_id: Uuid::now_v7(),
            stage: "validation".to_string(),
            agent_type: AgentType::Validation,
            priority: TaskPriority::Medium,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            timeout_ms: 120_000,
            created_at: Utc::now(),
            trace_id: Uuid::new_v4(),
            envelope_version: ENVELOPE_VERSION.to_string(),
            workflow_context: WorkflowContext {
                workflow_type: WorkflowType::App,
                workflow_name: "My App".to_string(),
                current_stage: "validation".to_string(),
                stage_outputs: outputs,
            },
            payload: AgentPayload::Validation {
                file_paths: vec!["src/main.rs".to_string()],
                output_dir: "/workspace/out".to_string(),
                strict: true,
            },
        }
    }

    #[test]
    fn test_round_trip_preserves_envelope() {
        let envelope = sample_envelope();
        let bytes = envelope.to_bytes().expect("should serialize");
        let parsed = AgentEnvelope::from_bytes(&bytes).expect("should deserialize");
        assert_eq!(envelope, parsed);

        // Re-serialization is stable up to key order
        let again = parsed.to_bytes().expect("should serialize");
        let a: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let b: serde_json::Value = serde_json::from_slice(&again).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(sample_envelope()).unwrap();
        assert_eq!(json["type"], "task");
        assert_eq!(json["envelope_version"], "1.0.0");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["agent_type"], "validation");
        assert_eq!(json["payload"]["kind"], "validation");
    }

    #[test]
    fn test_payload_agent_type_agreement() {
        let payload = AgentPayload::Deployment {
            environment: "staging".to_string(),
            artifact_dir: "/artifacts".to_string(),
            dry_run: false,
        };
        assert_eq!(payload.agent_type(), AgentType::Deployment);
    }
}
