//! Workflow lifecycle events published on `workflow:events`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{WorkflowStatus, WorkflowType};

/// Lifecycle marker carried in `metadata.stage`
///
/// The string forms are part of the wire contract consumed by the dashboard
/// cache and the event aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowLifecycle {
    Created,
    StageCompleted,
    Completed,
    Failed,
    Paused,
    Resumed,
}

impl WorkflowLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "orchestrator:workflow:created",
            Self::StageCompleted => "orchestrator:workflow:stage:completed",
            Self::Completed => "orchestrator:workflow:completed",
            Self::Failed => "orchestrator:workflow:failed",
            Self::Paused => "orchestrator:workflow:paused",
            Self::Resumed => "orchestrator:workflow:resumed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "orchestrator:workflow:created" => Some(Self::Created),
            "orchestrator:workflow:stage:completed" => Some(Self::StageCompleted),
            "orchestrator:workflow:completed" => Some(Self::Completed),
            "orchestrator:workflow:failed" => Some(Self::Failed),
            "orchestrator:workflow:paused" => Some(Self::Paused),
            "orchestrator:workflow:resumed" => Some(Self::Resumed),
            _ => None,
        }
    }
}

impl Serialize for WorkflowLifecycle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WorkflowLifecycle {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown lifecycle stage: {s}")))
    }
}

/// Metadata object on a lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEventMetadata {
    /// Lifecycle marker, e.g. `orchestrator:workflow:stage:completed`
    pub stage: WorkflowLifecycle,

    /// Definition stage name the event refers to, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload published on [`crate::topics::WORKFLOW_EVENTS_TOPIC`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEventMessage {
    pub workflow_id: Uuid,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    pub progress: i32,
    pub timestamp: DateTime<Utc>,
    pub metadata: WorkflowEventMetadata,
}

impl WorkflowEventMessage {
    pub fn new(
        workflow: &crate::workflow::Workflow,
        lifecycle: WorkflowLifecycle,
        error: Option<String>,
    ) -> Self {
        Self {
            workflow_id: workflow.id,
            workflow_type: workflow.workflow_type,
            status: workflow.status,
            progress: workflow.progress,
            timestamp: Utc::now(),
            metadata: WorkflowEventMetadata {
                stage: lifecycle,
                current_stage: Some(workflow.current_stage.clone()),
                error,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_wire_strings() {
        assert_eq!(
            WorkflowLifecycle::StageCompleted.as_str(),
            "orchestrator:workflow:stage:completed"
        );
        for lc in [
            WorkflowLifecycle::Created,
            WorkflowLifecycle::StageCompleted,
            WorkflowLifecycle::Completed,
            WorkflowLifecycle::Failed,
            WorkflowLifecycle::Paused,
            WorkflowLifecycle::Resumed,
        ] {
            assert_eq!(WorkflowLifecycle::from_str(lc.as_str()), Some(lc));
        }
    }

    #[test]
    fn test_metadata_stage_serializes_as_marker_string() {
        let meta = WorkflowEventMetadata {
            stage: WorkflowLifecycle::Failed,
            current_stage: Some("validation".to_string()),
            error: Some("agent crashed".to_string()),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["stage"], "orchestrator:workflow:failed");
    }
}
