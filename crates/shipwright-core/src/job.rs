//! Scheduled jobs, executions, and event handlers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskPriority;

/// How a job fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Fires on every cron match until cancelled
    Cron,
    /// Fires once at a fixed instant
    OneTime,
    /// Cron-driven with a start/end window or execution cap
    Recurring,
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Paused,
    Cancelled,
}

/// What the scheduler invokes when a job fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    /// In-process registry lookup by `handler_name`
    Function,
    /// Dispatch an agent envelope through the dispatcher
    Agent,
    /// Create a workflow
    Workflow,
}

/// Rolling execution statistics carried on a job row
///
/// Stats updates are best-effort and must never fail the operation that
/// produced them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub executions_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_duration_ms: u64,
}

impl JobStats {
    /// Fold one execution into the rolling stats
    ///
    /// `new_avg = round((old_avg * count + duration) / (count + 1))`
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        let count = self.executions_count;
        let total = self.avg_duration_ms as u128 * count as u128 + duration_ms as u128;
        // Integer rounding: (total + half-divisor) / divisor
        self.avg_duration_ms = ((total + (count as u128 + 1) / 2) / (count as u128 + 1)) as u64;
        self.executions_count = count + 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
    }
}

/// A cron, one-time, or recurring job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub name: String,
    pub job_type: JobType,

    /// Cron expression; `None` for one-time jobs
    pub schedule: Option<String>,

    /// IANA timezone the schedule is evaluated in
    pub timezone: String,

    /// Next fire instant in UTC; `None` once the job will not fire again
    pub next_run: Option<DateTime<Utc>>,

    // Recurring window
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_executions: Option<u32>,

    pub handler_name: String,
    pub handler_type: HandlerType,
    pub payload: serde_json::Value,

    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    pub priority: TaskPriority,

    /// Executor slots this job may occupy at once
    pub concurrency: u32,

    /// Whether a fire may start while a previous execution is still running
    pub allow_overlap: bool,

    pub stats: JobStats,
    pub status: JobStatus,

    pub tags: Vec<String>,
    pub platform_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Execution status of one job fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Timeout)
    }
}

/// One fire of a scheduled job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: ExecutionStatus,

    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,

    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_stack: Option<String>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,

    pub trace_id: Option<Uuid>,
    pub span_id: Option<String>,
}

/// What an event handler does when its event fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateJob,
    TriggerWorkflow,
    DispatchAgent,
    Function,
}

/// Rolling stats for an event handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStats {
    pub triggered_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

/// A persisted binding from an event name to an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHandler {
    pub id: Uuid,
    pub event_name: String,
    pub handler_name: String,
    pub enabled: bool,

    /// Handlers for the same event run in descending priority
    pub priority: i32,

    pub action_type: ActionType,
    pub action_config: serde_json::Value,

    /// `None` means the handler is global
    pub platform_id: Option<Uuid>,

    pub stats: HandlerStats,
}
