//! In-memory implementation of OrchestratorStore for testing
//!
//! Same semantics as the Postgres implementation, including the conditional
//! CAS stage advance.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use shipwright_core::{
    EventHandler, HandlerStats, JobExecution, JobStats, ScheduledJob, StageOutput, Task,
    TaskStatus, Workflow, WorkflowStatus, WorkflowType,
};

use crate::store::{
    DefinitionRow, ExecutionLog, JobFilter, OrchestratorStore, PipelineExecutionRow, StoreError,
};

/// In-memory store
#[derive(Default)]
pub struct InMemoryStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    definitions: RwLock<HashMap<(Option<Uuid>, WorkflowType), serde_json::Value>>,
    jobs: RwLock<HashMap<Uuid, ScheduledJob>>,
    executions: RwLock<HashMap<Uuid, JobExecution>>,
    execution_logs: RwLock<Vec<ExecutionLog>>,
    handlers: RwLock<HashMap<Uuid, EventHandler>>,
    pipelines: RwLock<HashMap<Uuid, PipelineExecutionRow>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored workflows (test observability)
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }
}

#[async_trait]
impl OrchestratorStore for InMemoryStore {
    // =========================================================================
    // Workflows
    // =========================================================================

    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.workflows
            .write()
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>, StoreError> {
        let mut workflows: Vec<Workflow> = self
            .workflows
            .read()
            .values()
            .filter(|w| status.map(|s| w.status == s).unwrap_or(true))
            .cloned()
            .collect();
        workflows.sort_by_key(|w| std::cmp::Reverse(w.created_at));
        Ok(workflows)
    }

    async fn advance_stage(
        &self,
        id: Uuid,
        expected_stage: &str,
        expected_version: i32,
        next_stage: &str,
        progress: i32,
        status: WorkflowStatus,
    ) -> Result<bool, StoreError> {
        let mut workflows = self.workflows.write();
        let Some(workflow) = workflows.get_mut(&id) else {
            return Ok(false);
        };

        if workflow.current_stage != expected_stage || workflow.version != expected_version {
            return Ok(false);
        }

        workflow.current_stage = next_stage.to_string();
        workflow.progress = progress;
        workflow.status = status;
        workflow.version += 1;
        workflow.updated_at = Utc::now();
        if status.is_terminal() && workflow.completed_at.is_none() {
            workflow.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn set_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow.status = status;
        if let Some(error) = error {
            workflow.last_error = Some(error.to_string());
        }
        if status.is_terminal() && workflow.completed_at.is_none() {
            workflow.completed_at = Some(Utc::now());
        }
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn append_stage_output(&self, id: Uuid, output: &StageOutput) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&id)
            .ok_or(StoreError::WorkflowNotFound(id))?;
        workflow.stage_outputs.retain(|o| o.stage != output.stage);
        workflow.stage_outputs.push(output.clone());
        workflow.updated_at = Utc::now();
        Ok(())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.status = status;
        if matches!(
            status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        ) {
            task.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn increment_task_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        task.completed_at = None;
        Ok(task.retry_count)
    }

    async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn latest_task_for_stage(
        &self,
        workflow_id: Uuid,
        stage: &str,
    ) -> Result<Option<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.workflow_id == workflow_id && t.stage == stage)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    // =========================================================================
    // Workflow definitions
    // =========================================================================

    async fn get_definition(
        &self,
        platform_id: Option<Uuid>,
        workflow_type: WorkflowType,
    ) -> Result<Option<DefinitionRow>, StoreError> {
        Ok(self
            .definitions
            .read()
            .get(&(platform_id, workflow_type))
            .cloned()
            .map(|definition| DefinitionRow {
                platform_id,
                workflow_type,
                definition,
            }))
    }

    async fn put_definition(&self, row: &DefinitionRow) -> Result<(), StoreError> {
        self.definitions
            .write()
            .insert((row.platform_id, row.workflow_type), row.definition.clone());
        Ok(())
    }

    // =========================================================================
    // Scheduled jobs
    // =========================================================================

    async fn create_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        self.jobs.write().insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<ScheduledJob, StoreError> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::JobNotFound(id))
    }

    async fn update_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        if !jobs.contains_key(&job.id) {
            return Err(StoreError::JobNotFound(job.id));
        }
        let mut updated = job.clone();
        updated.updated_at = Utc::now();
        jobs.insert(job.id, updated);
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<(), StoreError> {
        self.jobs.write().remove(&id);
        self.executions.write().retain(|_, e| e.job_id != id);
        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut jobs: Vec<ScheduledJob> = self
            .jobs
            .read()
            .values()
            .filter(|j| filter.status.map(|s| j.status == s).unwrap_or(true))
            .filter(|j| {
                filter
                    .platform_id
                    .map(|p| j.platform_id == Some(p))
                    .unwrap_or(true)
            })
            .filter(|j| {
                filter
                    .tag
                    .as_ref()
                    .map(|t| j.tags.contains(t))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        Ok(jobs)
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut jobs: Vec<ScheduledJob> = self
            .jobs
            .read()
            .values()
            .filter(|j| {
                j.status == shipwright_core::JobStatus::Active
                    && j.next_run.map(|t| t <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.next_run);
        Ok(jobs)
    }

    async fn update_job_stats(&self, id: Uuid, stats: &JobStats) -> Result<(), StoreError> {
        if let Some(job) = self.jobs.write().get_mut(&id) {
            job.stats = *stats;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    // =========================================================================
    // Job executions
    // =========================================================================

    async fn create_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        self.executions
            .write()
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if !executions.contains_key(&execution.id) {
            return Err(StoreError::ExecutionNotFound(execution.id));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<JobExecution, StoreError> {
        self.executions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn list_executions(&self, job_id: Uuid) -> Result<Vec<JobExecution>, StoreError> {
        let mut executions: Vec<JobExecution> = self
            .executions
            .read()
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.scheduled_at);
        Ok(executions)
    }

    async fn due_retry_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobExecution>, StoreError> {
        let mut executions: Vec<JobExecution> = self
            .executions
            .read()
            .values()
            .filter(|e| {
                e.status == shipwright_core::ExecutionStatus::Pending
                    && e.retry_count > 0
                    && e.scheduled_at <= now
            })
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.scheduled_at);
        Ok(executions)
    }

    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        level: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        self.execution_logs.write().push(ExecutionLog {
            id: Uuid::now_v7(),
            execution_id,
            level: level.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn execution_logs(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLog>, StoreError> {
        let mut logs: Vec<ExecutionLog> = self
            .execution_logs
            .read()
            .iter()
            .filter(|l| l.execution_id == execution_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.created_at);
        Ok(logs)
    }

    // =========================================================================
    // Event handlers
    // =========================================================================

    async fn upsert_event_handler(&self, handler: &EventHandler) -> Result<(), StoreError> {
        self.handlers.write().insert(handler.id, handler.clone());
        Ok(())
    }

    async fn delete_event_handler(&self, id: Uuid) -> Result<(), StoreError> {
        self.handlers.write().remove(&id);
        Ok(())
    }

    async fn list_event_handlers(
        &self,
        event_name: Option<&str>,
    ) -> Result<Vec<EventHandler>, StoreError> {
        let mut handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .values()
            .filter(|h| h.enabled)
            .filter(|h| event_name.map(|n| h.event_name == n).unwrap_or(true))
            .cloned()
            .collect();
        handlers.sort_by_key(|h| std::cmp::Reverse(h.priority));
        Ok(handlers)
    }

    async fn update_handler_stats(
        &self,
        id: Uuid,
        stats: &HandlerStats,
    ) -> Result<(), StoreError> {
        if let Some(handler) = self.handlers.write().get_mut(&id) {
            handler.stats = *stats;
        }
        Ok(())
    }

    // =========================================================================
    // Pipeline executions
    // =========================================================================

    async fn save_pipeline_execution(&self, row: &PipelineExecutionRow) -> Result<(), StoreError> {
        self.pipelines.write().insert(row.id, row.clone());
        Ok(())
    }

    async fn get_pipeline_execution(&self, id: Uuid) -> Result<PipelineExecutionRow, StoreError> {
        self.pipelines
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }
}
