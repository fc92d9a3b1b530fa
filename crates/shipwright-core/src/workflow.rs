//! Workflow entity and lifecycle status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of delivery request a workflow represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    /// Build a new application from requirements
    App,
    /// Add a feature to an existing application
    Feature,
    /// Fix a reported bug
    Bugfix,
    /// Run a multi-stage delivery pipeline
    Pipeline,
    /// Provision infrastructure
    Terraform,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Pipeline => "pipeline",
            Self::Terraform => "terraform",
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = crate::error::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(Self::App),
            "feature" => Ok(Self::Feature),
            "bugfix" => Ok(Self::Bugfix),
            "pipeline" => Ok(Self::Pipeline),
            "terraform" => Ok(Self::Terraform),
            other => Err(crate::error::ValidationError::UnknownWorkflowType(
                other.to_string(),
            )),
        }
    }
}

/// Workflow status
///
/// Terminal states are `Completed`, `Failed`, and `Cancelled`; no transition
/// leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, first stage not yet dispatched
    Initiated,
    /// A stage task is in flight
    Running,
    /// Waiting on a decision or clarification
    Paused,
    /// All stages completed
    Completed,
    /// A stage exhausted its retries or a dispatch failed
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The structured output a stage produced, retained for downstream stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Stage name from the active definition
    pub stage: String,

    /// Agent result body for this stage
    pub output: serde_json::Value,

    /// When the stage reached its terminal per-stage state
    pub completed_at: DateTime<Utc>,
}

/// The unit of work driven by the orchestrator
///
/// A workflow exclusively owns its tasks, stage outputs, and FSM instance.
/// `version` is bumped on every successful compare-and-swap stage update and
/// is strictly monotonic across a workflow's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,

    pub workflow_type: WorkflowType,

    /// Owning platform; absent means the legacy fallback definition applies
    pub platform_id: Option<Uuid>,

    pub status: WorkflowStatus,

    /// Name of a stage in the active definition (meaningless once terminal)
    pub current_stage: String,

    /// Derived from definition weights, clamped to 0..=100
    pub progress: i32,

    /// Outputs in stage-completion order
    pub stage_outputs: Vec<StageOutput>,

    /// Optimistic concurrency token for CAS stage updates
    pub version: i32,

    pub name: String,

    pub description: Option<String>,

    /// Free-form requirements captured at submission
    pub requirements: Option<serde_json::Value>,

    pub created_by: Option<String>,

    pub trace_id: Uuid,

    /// Last user-visible error message, set when status becomes `failed`
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Look up the retained output for a stage, if it completed at least once
    pub fn stage_output(&self, stage: &str) -> Option<&StageOutput> {
        self.stage_outputs.iter().find(|o| o.stage == stage)
    }

    /// Stage outputs as a name -> output mapping for envelope context
    pub fn outputs_by_stage(&self) -> serde_json::Map<String, serde_json::Value> {
        self.stage_outputs
            .iter()
            .map(|o| (o.stage.clone(), o.output.clone()))
            .collect()
    }
}

/// Validated input for creating a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkflow {
    pub workflow_type: WorkflowType,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requirements: Option<serde_json::Value>,
    #[serde(default)]
    pub platform_id: Option<Uuid>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Descriptor stored in the `agents:registry` hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub agent_type: crate::task::AgentType,
    pub status: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Initiated.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
    }

    #[test]
    fn test_workflow_type_round_trip() {
        for ty in ["app", "feature", "bugfix", "pipeline", "terraform"] {
            let parsed: WorkflowType = ty.parse().expect("should parse");
            assert_eq!(parsed.as_str(), ty);
        }
        assert!("desktop".parse::<WorkflowType>().is_err());
    }

    #[test]
    fn test_stage_output_lookup() {
        let wf = Workflow {
            id: Uuid::now_v7(),
            workflow_type: WorkflowType::App,
            platform_id: None,
            status: WorkflowStatus::Running,
            current_stage: "validation".to_string(),
            progress: 50,
            stage_outputs: vec![StageOutput {
                stage: "scaffolding".to_string(),
                output: serde_json::json!({ "files_generated": ["src/main.rs"] }),
                completed_at: Utc::now(),
            }],
            version: 2,
            name: "My App".to_string(),
            description: None,
            requirements: None,
            created_by: None,
            trace_id: Uuid::new_v4(),
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        };

        assert!(wf.stage_output("scaffolding").is_some());
        assert!(wf.stage_output("deployment").is_none());
        assert_eq!(wf.outputs_by_stage().len(), 1);
    }
}
