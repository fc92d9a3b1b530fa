//! OrchestratorStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use shipwright_core::{
    EventHandler, HandlerStats, JobExecution, JobStats, JobStatus, ScheduledJob, StageOutput, Task,
    TaskStatus, Workflow, WorkflowStatus, WorkflowType,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A stored workflow definition, shape-opaque at this layer
///
/// The definition engine owns the typed shape; the store only persists and
/// keys it by (platform, workflow_type).
#[derive(Debug, Clone)]
pub struct DefinitionRow {
    pub platform_id: Option<Uuid>,
    pub workflow_type: WorkflowType,
    pub definition: serde_json::Value,
}

/// Persisted state of a pipeline run (C12)
#[derive(Debug, Clone)]
pub struct PipelineExecutionRow {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub state: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// One structured log line attached to a job execution
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for listing scheduled jobs
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub platform_id: Option<Uuid>,
    pub tag: Option<String>,
}

/// Relational persistence port
///
/// Implementations must be thread-safe; every mutation is atomic at the row
/// level. The only multi-row invariant (stage advance) is enforced by the
/// conditional UPDATE in [`OrchestratorStore::advance_stage`].
#[async_trait]
pub trait OrchestratorStore: Send + Sync + 'static {
    // =========================================================================
    // Workflows
    // =========================================================================

    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError>;

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>, StoreError>;

    /// Compare-and-swap stage advance:
    ///
    /// `UPDATE workflows SET current_stage = next, progress = p, status = s,
    /// version = version + 1 WHERE id = ? AND current_stage = expected AND
    /// version = expected_version`
    ///
    /// Returns true when exactly one row changed; false means another worker
    /// won the race and the caller must stop.
    #[allow(clippy::too_many_arguments)]
    async fn advance_stage(
        &self,
        id: Uuid,
        expected_stage: &str,
        expected_version: i32,
        next_stage: &str,
        progress: i32,
        status: WorkflowStatus,
    ) -> Result<bool, StoreError>;

    /// Set status (and `last_error` / `completed_at` where applicable)
    /// unconditionally.
    async fn set_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Record a stage's output, replacing any earlier output for the same
    /// stage.
    async fn append_stage_output(&self, id: Uuid, output: &StageOutput) -> Result<(), StoreError>;

    // =========================================================================
    // Tasks
    // =========================================================================

    async fn create_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError>;

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError>;

    /// Bump retry_count, returning the new value
    async fn increment_task_retry(&self, id: Uuid) -> Result<u32, StoreError>;

    async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Most recent task for (workflow, stage), if any
    async fn latest_task_for_stage(
        &self,
        workflow_id: Uuid,
        stage: &str,
    ) -> Result<Option<Task>, StoreError>;

    // =========================================================================
    // Workflow definitions
    // =========================================================================

    /// Definition for (platform, workflow_type); `None` lets the caller fall
    /// back to the legacy table.
    async fn get_definition(
        &self,
        platform_id: Option<Uuid>,
        workflow_type: WorkflowType,
    ) -> Result<Option<DefinitionRow>, StoreError>;

    async fn put_definition(&self, row: &DefinitionRow) -> Result<(), StoreError>;

    // =========================================================================
    // Scheduled jobs
    // =========================================================================

    async fn create_job(&self, job: &ScheduledJob) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<ScheduledJob, StoreError>;

    async fn update_job(&self, job: &ScheduledJob) -> Result<(), StoreError>;

    async fn delete_job(&self, id: Uuid) -> Result<(), StoreError>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Active jobs whose next_run is at or before `now`
    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Stats updates are swallow-and-log at the call site; this method still
    /// reports its own failure so the caller can log it.
    async fn update_job_stats(&self, id: Uuid, stats: &JobStats) -> Result<(), StoreError>;

    // =========================================================================
    // Job executions
    // =========================================================================

    async fn create_execution(&self, execution: &JobExecution) -> Result<(), StoreError>;

    async fn update_execution(&self, execution: &JobExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<JobExecution, StoreError>;

    async fn list_executions(&self, job_id: Uuid) -> Result<Vec<JobExecution>, StoreError>;

    /// Pending retry executions whose scheduled_at is due
    async fn due_retry_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobExecution>, StoreError>;

    /// Attach a log line to an execution
    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        level: &str,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Log lines for an execution, oldest first
    async fn execution_logs(&self, execution_id: Uuid)
        -> Result<Vec<ExecutionLog>, StoreError>;

    // =========================================================================
    // Event handlers
    // =========================================================================

    async fn upsert_event_handler(&self, handler: &EventHandler) -> Result<(), StoreError>;

    async fn delete_event_handler(&self, id: Uuid) -> Result<(), StoreError>;

    /// Enabled handlers for an event (all events when `None`), ordered by
    /// descending priority
    async fn list_event_handlers(
        &self,
        event_name: Option<&str>,
    ) -> Result<Vec<EventHandler>, StoreError>;

    async fn update_handler_stats(
        &self,
        id: Uuid,
        stats: &HandlerStats,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Pipeline executions
    // =========================================================================

    async fn save_pipeline_execution(&self, row: &PipelineExecutionRow) -> Result<(), StoreError>;

    async fn get_pipeline_execution(&self, id: Uuid) -> Result<PipelineExecutionRow, StoreError>;
}
