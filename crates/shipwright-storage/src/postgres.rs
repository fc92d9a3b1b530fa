//! Postgres implementation of the OrchestratorStore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use shipwright_core::{
    EventHandler, HandlerStats, JobExecution, JobStats, ScheduledJob, StageOutput, Task,
    TaskStatus, Workflow, WorkflowStatus, WorkflowType,
};

use crate::models::{
    enum_str, EventHandlerRow, JobExecutionRow, ScheduledJobRow, TaskRow, WorkflowRow,
};
use crate::store::{
    DefinitionRow, ExecutionLog, JobFilter, OrchestratorStore, PipelineExecutionRow, StoreError,
};

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations
    pub async fn from_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OrchestratorStore for PgStore {
    // ============================================
    // Workflows
    // ============================================

    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let stage_outputs = serde_json::to_value(&workflow.stage_outputs)?;
        sqlx::query(
            r#"
            INSERT INTO workflows (
                id, workflow_type, platform_id, status, current_stage, progress,
                stage_outputs, version, name, description, requirements,
                created_by, trace_id, last_error, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(workflow.id)
        .bind(enum_str(&workflow.workflow_type))
        .bind(workflow.platform_id)
        .bind(enum_str(&workflow.status))
        .bind(&workflow.current_stage)
        .bind(workflow.progress)
        .bind(&stage_outputs)
        .bind(workflow.version)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.requirements)
        .bind(&workflow.created_by)
        .bind(workflow.trace_id)
        .bind(&workflow.last_error)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .bind(workflow.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, workflow_type, platform_id, status, current_stage, progress,
                   stage_outputs, version, name, description, requirements,
                   created_by, trace_id, last_error, created_at, updated_at, completed_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::WorkflowNotFound(id))?;

        row.try_into()
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, WorkflowRow>(
                    r#"
                    SELECT id, workflow_type, platform_id, status, current_stage, progress,
                           stage_outputs, version, name, description, requirements,
                           created_by, trace_id, last_error, created_at, updated_at, completed_at
                    FROM workflows
                    WHERE status = $1
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(enum_str(&status))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, WorkflowRow>(
                    r#"
                    SELECT id, workflow_type, platform_id, status, current_stage, progress,
                           stage_outputs, version, name, description, requirements,
                           created_by, trace_id, last_error, created_at, updated_at, completed_at
                    FROM workflows
                    ORDER BY created_at DESC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(TryInto::try_into).collect()
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
        let completed_at = status.is_terminal().then(Utc::now);

        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET current_stage = $4,
                progress = $5,
                status = $6,
                version = version + 1,
                completed_at = COALESCE($7, completed_at),
                updated_at = NOW()
            WHERE id = $1 AND current_stage = $2 AND version = $3
            "#,
        )
        .bind(id)
        .bind(expected_stage)
        .bind(expected_version)
        .bind(next_stage)
        .bind(progress)
        .bind(enum_str(&status))
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let completed_at = status.is_terminal().then(Utc::now);

        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = $2,
                last_error = COALESCE($3, last_error),
                completed_at = COALESCE($4, completed_at),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(enum_str(&status))
        .bind(error)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(id));
        }
        Ok(())
    }

    async fn append_stage_output(&self, id: Uuid, output: &StageOutput) -> Result<(), StoreError> {
        let appended = serde_json::to_value(vec![output])?;

        // Drop any earlier output for the same stage, then append
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET stage_outputs = (
                    SELECT COALESCE(jsonb_agg(o), '[]'::jsonb)
                    FROM jsonb_array_elements(stage_outputs) AS o
                    WHERE o->>'stage' <> $2
                ) || $3::jsonb,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&output.stage)
        .bind(&appended)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(id));
        }
        Ok(())
    }

    // ============================================
    // Tasks
    // ============================================

    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, workflow_id, agent_type, action, stage, status,
                retry_count, max_retries, timeout_ms, priority, payload,
                created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(task.id)
        .bind(task.workflow_id)
        .bind(enum_str(&task.agent_type))
        .bind(&task.action)
        .bind(&task.stage)
        .bind(enum_str(&task.status))
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.timeout_ms as i64)
        .bind(enum_str(&task.priority))
        .bind(&task.payload)
        .bind(task.created_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, workflow_id, agent_type, action, stage, status,
                   retry_count, max_retries, timeout_ms, priority, payload,
                   created_at, completed_at
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::TaskNotFound(id))?;

        row.try_into()
    }

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let completed_at = matches!(
            status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
        .then(Utc::now);

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, completed_at = COALESCE($3, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(enum_str(&status))
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn increment_task_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let retry_count: i32 = sqlx::query_scalar(
            r#"
            UPDATE tasks
            SET retry_count = retry_count + 1, status = 'pending', completed_at = NULL
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::TaskNotFound(id))?;

        Ok(retry_count.max(0) as u32)
    }

    async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, workflow_id, agent_type, action, stage, status,
                   retry_count, max_retries, timeout_ms, priority, payload,
                   created_at, completed_at
            FROM tasks
            WHERE workflow_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn latest_task_for_stage(
        &self,
        workflow_id: Uuid,
        stage: &str,
    ) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, workflow_id, agent_type, action, stage, status,
                   retry_count, max_retries, timeout_ms, priority, payload,
                   created_at, completed_at
            FROM tasks
            WHERE workflow_id = $1 AND stage = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    // ============================================
    // Workflow definitions
    // ============================================

    async fn get_definition(
        &self,
        platform_id: Option<Uuid>,
        workflow_type: WorkflowType,
    ) -> Result<Option<DefinitionRow>, StoreError> {
        let row: Option<(Option<Uuid>, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT platform_id, definition
            FROM workflow_definitions
            WHERE platform_id IS NOT DISTINCT FROM $1 AND workflow_type = $2
            "#,
        )
        .bind(platform_id)
        .bind(enum_str(&workflow_type))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(platform_id, definition)| DefinitionRow {
            platform_id,
            workflow_type,
            definition,
        }))
    }

    async fn put_definition(&self, row: &DefinitionRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (platform_id, workflow_type, definition, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (platform_id, workflow_type)
            DO UPDATE SET definition = EXCLUDED.definition, updated_at = NOW()
            "#,
        )
        .bind(row.platform_id)
        .bind(enum_str(&row.workflow_type))
        .bind(&row.definition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============================================
    // Scheduled jobs
    // ============================================

    async fn create_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let tags = serde_json::to_value(&job.tags)?;
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                id, name, job_type, schedule, timezone, next_run,
                start_date, end_date, max_executions,
                handler_name, handler_type, payload,
                max_retries, retry_delay_ms, timeout_ms, priority, concurrency, allow_overlap,
                executions_count, success_count, failure_count, avg_duration_ms,
                status, tags, platform_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(enum_str(&job.job_type))
        .bind(&job.schedule)
        .bind(&job.timezone)
        .bind(job.next_run)
        .bind(job.start_date)
        .bind(job.end_date)
        .bind(job.max_executions.map(|n| n as i32))
        .bind(&job.handler_name)
        .bind(enum_str(&job.handler_type))
        .bind(&job.payload)
        .bind(job.max_retries as i32)
        .bind(job.retry_delay_ms as i64)
        .bind(job.timeout_ms as i64)
        .bind(enum_str(&job.priority))
        .bind(job.concurrency as i32)
        .bind(job.allow_overlap)
        .bind(job.stats.executions_count as i64)
        .bind(job.stats.success_count as i64)
        .bind(job.stats.failure_count as i64)
        .bind(job.stats.avg_duration_ms as i64)
        .bind(enum_str(&job.status))
        .bind(&tags)
        .bind(job.platform_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<ScheduledJob, StoreError> {
        let row = sqlx::query_as::<_, ScheduledJobRow>(
            r#"SELECT * FROM scheduled_jobs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::JobNotFound(id))?;

        row.try_into()
    }

    async fn update_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let tags = serde_json::to_value(&job.tags)?;
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET name = $2, schedule = $3, timezone = $4, next_run = $5,
                start_date = $6, end_date = $7, max_executions = $8,
                handler_name = $9, handler_type = $10, payload = $11,
                max_retries = $12, retry_delay_ms = $13, timeout_ms = $14,
                priority = $15, concurrency = $16, allow_overlap = $17,
                status = $18, tags = $19, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(&job.timezone)
        .bind(job.next_run)
        .bind(job.start_date)
        .bind(job.end_date)
        .bind(job.max_executions.map(|n| n as i32))
        .bind(&job.handler_name)
        .bind(enum_str(&job.handler_type))
        .bind(&job.payload)
        .bind(job.max_retries as i32)
        .bind(job.retry_delay_ms as i64)
        .bind(job.timeout_ms as i64)
        .bind(enum_str(&job.priority))
        .bind(job.concurrency as i32)
        .bind(job.allow_overlap)
        .bind(enum_str(&job.status))
        .bind(&tags)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job.id));
        }
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(
            r#"
            SELECT * FROM scheduled_jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR platform_id = $2)
              AND ($3::text IS NULL OR tags ? $3)
            ORDER BY created_at DESC
            "#,
        )
        .bind(filter.status.map(|s| enum_str(&s)))
        .bind(filter.platform_id)
        .bind(&filter.tag)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = sqlx::query_as::<_, ScheduledJobRow>(
            r#"
            SELECT * FROM scheduled_jobs
            WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= $1
            ORDER BY next_run ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_job_stats(&self, id: Uuid, stats: &JobStats) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET executions_count = $2, success_count = $3, failure_count = $4,
                avg_duration_ms = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(stats.executions_count as i64)
        .bind(stats.success_count as i64)
        .bind(stats.failure_count as i64)
        .bind(stats.avg_duration_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============================================
    // Job executions
    // ============================================

    async fn create_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_executions (
                id, job_id, status, scheduled_at, started_at, completed_at,
                duration_ms, result, error, error_stack,
                retry_count, max_retries, next_retry_at, trace_id, span_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(execution.id)
        .bind(execution.job_id)
        .bind(enum_str(&execution.status))
        .bind(execution.scheduled_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_ms.map(|d| d as i64))
        .bind(&execution.result)
        .bind(&execution.error)
        .bind(&execution.error_stack)
        .bind(execution.retry_count as i32)
        .bind(execution.max_retries as i32)
        .bind(execution.next_retry_at)
        .bind(execution.trace_id)
        .bind(&execution.span_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_execution(&self, execution: &JobExecution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2, started_at = $3, completed_at = $4, duration_ms = $5,
                result = $6, error = $7, error_stack = $8,
                retry_count = $9, next_retry_at = $10
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(enum_str(&execution.status))
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_ms.map(|d| d as i64))
        .bind(&execution.result)
        .bind(&execution.error)
        .bind(&execution.error_stack)
        .bind(execution.retry_count as i32)
        .bind(execution.next_retry_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(execution.id));
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<JobExecution, StoreError> {
        let row = sqlx::query_as::<_, JobExecutionRow>(
            r#"SELECT * FROM job_executions WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::ExecutionNotFound(id))?;

        row.try_into()
    }

    async fn list_executions(&self, job_id: Uuid) -> Result<Vec<JobExecution>, StoreError> {
        let rows = sqlx::query_as::<_, JobExecutionRow>(
            r#"
            SELECT * FROM job_executions
            WHERE job_id = $1
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn due_retry_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobExecution>, StoreError> {
        let rows = sqlx::query_as::<_, JobExecutionRow>(
            r#"
            SELECT * FROM job_executions
            WHERE status = 'pending' AND retry_count > 0 AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        level: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_execution_logs (id, execution_id, level, message, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(level)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn execution_logs(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLog>, StoreError> {
        let rows: Vec<(Uuid, Uuid, String, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, execution_id, level, message, created_at
            FROM job_execution_logs
            WHERE execution_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, execution_id, level, message, created_at)| ExecutionLog {
                id,
                execution_id,
                level,
                message,
                created_at,
            })
            .collect())
    }

    // ============================================
    // Event handlers
    // ============================================

    async fn upsert_event_handler(&self, handler: &EventHandler) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO event_handlers (
                id, event_name, handler_name, enabled, priority,
                action_type, action_config, platform_id,
                triggered_count, success_count, failure_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id)
            DO UPDATE SET event_name = EXCLUDED.event_name,
                          handler_name = EXCLUDED.handler_name,
                          enabled = EXCLUDED.enabled,
                          priority = EXCLUDED.priority,
                          action_type = EXCLUDED.action_type,
                          action_config = EXCLUDED.action_config,
                          platform_id = EXCLUDED.platform_id
            "#,
        )
        .bind(handler.id)
        .bind(&handler.event_name)
        .bind(&handler.handler_name)
        .bind(handler.enabled)
        .bind(handler.priority)
        .bind(enum_str(&handler.action_type))
        .bind(&handler.action_config)
        .bind(handler.platform_id)
        .bind(handler.stats.triggered_count as i64)
        .bind(handler.stats.success_count as i64)
        .bind(handler.stats.failure_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_event_handler(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM event_handlers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_event_handlers(
        &self,
        event_name: Option<&str>,
    ) -> Result<Vec<EventHandler>, StoreError> {
        let rows = sqlx::query_as::<_, EventHandlerRow>(
            r#"
            SELECT * FROM event_handlers
            WHERE enabled AND ($1::text IS NULL OR event_name = $1)
            ORDER BY priority DESC
            "#,
        )
        .bind(event_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_handler_stats(
        &self,
        id: Uuid,
        stats: &HandlerStats,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE event_handlers
            SET triggered_count = $2, success_count = $3, failure_count = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(stats.triggered_count as i64)
        .bind(stats.success_count as i64)
        .bind(stats.failure_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============================================
    // Pipeline executions
    // ============================================

    async fn save_pipeline_execution(&self, row: &PipelineExecutionRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_executions (id, name, status, state, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id)
            DO UPDATE SET status = EXCLUDED.status,
                          state = EXCLUDED.state,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.status)
        .bind(&row.state)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pipeline_execution(&self, id: Uuid) -> Result<PipelineExecutionRow, StoreError> {
        let row: Option<(Uuid, String, String, serde_json::Value, DateTime<Utc>)> =
            sqlx::query_as(
                r#"SELECT id, name, status, state, updated_at FROM pipeline_executions WHERE id = $1"#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let (id, name, status, state, updated_at) = row.ok_or(StoreError::ExecutionNotFound(id))?;
        Ok(PipelineExecutionRow {
            id,
            name,
            status,
            state,
            updated_at,
        })
    }
}
