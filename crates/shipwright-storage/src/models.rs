//! Database row types and their domain conversions

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use shipwright_core::{
    EventHandler, HandlerStats, JobExecution, JobStats, ScheduledJob, StageOutput, Task, Workflow,
};

use crate::store::StoreError;

/// Snake-case enum string as stored in TEXT columns
pub(crate) fn enum_str<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

pub(crate) fn parse_enum<T: DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| StoreError::Serialization(format!("bad enum value {s:?}: {e}")))
}

#[derive(Debug, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub workflow_type: String,
    pub platform_id: Option<Uuid>,
    pub status: String,
    pub current_stage: String,
    pub progress: i32,
    pub stage_outputs: serde_json::Value,
    pub version: i32,
    pub name: String,
    pub description: Option<String>,
    pub requirements: Option<serde_json::Value>,
    pub created_by: Option<String>,
    pub trace_id: Uuid,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = StoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let stage_outputs: Vec<StageOutput> = serde_json::from_value(row.stage_outputs)
            .map_err(|e| StoreError::Serialization(format!("stage_outputs: {e}")))?;
        Ok(Workflow {
            id: row.id,
            workflow_type: parse_enum(&row.workflow_type)?,
            platform_id: row.platform_id,
            status: parse_enum(&row.status)?,
            current_stage: row.current_stage,
            progress: row.progress,
            stage_outputs,
            version: row.version,
            name: row.name,
            description: row.description,
            requirements: row.requirements,
            created_by: row.created_by,
            trace_id: row.trace_id,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub agent_type: String,
    pub action: String,
    pub stage: String,
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub timeout_ms: i64,
    pub priority: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            workflow_id: row.workflow_id,
            agent_type: parse_enum(&row.agent_type)?,
            action: row.action,
            stage: row.stage,
            status: parse_enum(&row.status)?,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            timeout_ms: row.timeout_ms.max(0) as u64,
            priority: parse_enum(&row.priority)?,
            payload: row.payload,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct ScheduledJobRow {
    pub id: Uuid,
    pub name: String,
    pub job_type: String,
    pub schedule: Option<String>,
    pub timezone: String,
    pub next_run: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_executions: Option<i32>,
    pub handler_name: String,
    pub handler_type: String,
    pub payload: serde_json::Value,
    pub max_retries: i32,
    pub retry_delay_ms: i64,
    pub timeout_ms: i64,
    pub priority: String,
    pub concurrency: i32,
    pub allow_overlap: bool,
    pub executions_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub avg_duration_ms: i64,
    pub status: String,
    pub tags: serde_json::Value,
    pub platform_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduledJobRow> for ScheduledJob {
    type Error = StoreError;

    fn try_from(row: ScheduledJobRow) -> Result<Self, Self::Error> {
        let tags: Vec<String> = serde_json::from_value(row.tags)
            .map_err(|e| StoreError::Serialization(format!("tags: {e}")))?;
        Ok(ScheduledJob {
            id: row.id,
            name: row.name,
            job_type: parse_enum(&row.job_type)?,
            schedule: row.schedule,
            timezone: row.timezone,
            next_run: row.next_run,
            start_date: row.start_date,
            end_date: row.end_date,
            max_executions: row.max_executions.map(|n| n.max(0) as u32),
            handler_name: row.handler_name,
            handler_type: parse_enum(&row.handler_type)?,
            payload: row.payload,
            max_retries: row.max_retries.max(0) as u32,
            retry_delay_ms: row.retry_delay_ms.max(0) as u64,
            timeout_ms: row.timeout_ms.max(0) as u64,
            priority: parse_enum(&row.priority)?,
            concurrency: row.concurrency.max(0) as u32,
            allow_overlap: row.allow_overlap,
            stats: JobStats {
                executions_count: row.executions_count.max(0) as u64,
                success_count: row.success_count.max(0) as u64,
                failure_count: row.failure_count.max(0) as u64,
                avg_duration_ms: row.avg_duration_ms.max(0) as u64,
            },
            status: parse_enum(&row.status)?,
            tags,
            platform_id: row.platform_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct JobExecutionRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub trace_id: Option<Uuid>,
    pub span_id: Option<String>,
}

impl TryFrom<JobExecutionRow> for JobExecution {
    type Error = StoreError;

    fn try_from(row: JobExecutionRow) -> Result<Self, Self::Error> {
        Ok(JobExecution {
            id: row.id,
            job_id: row.job_id,
            status: parse_enum(&row.status)?,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms.map(|d| d.max(0) as u64),
            result: row.result,
            error: row.error,
            error_stack: row.error_stack,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            next_retry_at: row.next_retry_at,
            trace_id: row.trace_id,
            span_id: row.span_id,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct EventHandlerRow {
    pub id: Uuid,
    pub event_name: String,
    pub handler_name: String,
    pub enabled: bool,
    pub priority: i32,
    pub action_type: String,
    pub action_config: serde_json::Value,
    pub platform_id: Option<Uuid>,
    pub triggered_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
}

impl TryFrom<EventHandlerRow> for EventHandler {
    type Error = StoreError;

    fn try_from(row: EventHandlerRow) -> Result<Self, Self::Error> {
        Ok(EventHandler {
            id: row.id,
            event_name: row.event_name,
            handler_name: row.handler_name,
            enabled: row.enabled,
            priority: row.priority,
            action_type: parse_enum(&row.action_type)?,
            action_config: row.action_config,
            platform_id: row.platform_id,
            stats: HandlerStats {
                triggered_count: row.triggered_count.max(0) as u64,
                success_count: row.success_count.max(0) as u64,
                failure_count: row.failure_count.max(0) as u64,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_core::{TaskPriority, WorkflowStatus, WorkflowType};

    #[test]
    fn test_enum_str_round_trip() {
        assert_eq!(enum_str(&WorkflowType::App), "app");
        assert_eq!(enum_str(&WorkflowStatus::Running), "running");
        assert_eq!(enum_str(&TaskPriority::Critical), "critical");

        let status: WorkflowStatus = parse_enum("completed").expect("should parse");
        assert_eq!(status, WorkflowStatus::Completed);
        assert!(parse_enum::<WorkflowStatus>("exploded").is_err());
    }
}
