//! Tasks - one attempt at a workflow stage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Agent pool a task is routed to
///
/// This is a closed sum: adding an agent type is an additive change here and
/// in [`crate::envelope::AgentPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Scaffold,
    Validation,
    E2e,
    Integration,
    Deployment,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scaffold => "scaffold",
            Self::Validation => "validation",
            Self::E2e => "e2e",
            Self::Integration => "integration",
            Self::Deployment => "deployment",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = crate::error::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scaffold" => Ok(Self::Scaffold),
            "validation" => Ok(Self::Validation),
            "e2e" => Ok(Self::E2e),
            "integration" => Ok(Self::Integration),
            "deployment" => Ok(Self::Deployment),
            other => Err(crate::error::ValidationError::UnknownAgentType(
                other.to_string(),
            )),
        }
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Dispatch priority carried on envelopes and jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// One attempt at a stage
///
/// A task is dispatchable only while its workflow is non-terminal and the
/// workflow's `current_stage` equals `stage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub agent_type: AgentType,

    /// Verb the agent performs for this stage (e.g. "scaffold", "validate")
    pub action: String,

    pub stage: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub priority: TaskPriority,

    /// The serialized [`crate::envelope::AgentEnvelope`] dispatched for this attempt
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_type_round_trip() {
        for ty in ["scaffold", "validation", "e2e", "integration", "deployment"] {
            let parsed: AgentType = ty.parse().expect("should parse");
            assert_eq!(parsed.as_str(), ty);
        }
        assert!("review".parse::<AgentType>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }

    #[test]
    fn test_retries_exhausted() {
        let task = Task {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            agent_type: AgentType::Scaffold,
            action: "scaffold".to_string(),
            stage: "scaffolding".to_string(),
            status: TaskStatus::Failed,
            retry_count: 3,
            max_retries: 3,
            timeout_ms: 60_000,
            priority: TaskPriority::Medium,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
            completed_at: None,
        };
        assert!(task.retries_exhausted());
    }
}
