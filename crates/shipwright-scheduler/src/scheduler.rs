//! Job scheduling: submit-time validation, next-run computation, and the
//! tick that turns due jobs into dispatches

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use shipwright_bus::MessageBus;
use shipwright_core::topics::{
    JOB_CANCELLED_TOPIC, JOB_CREATED_TOPIC, JOB_DELETED_TOPIC, JOB_DISPATCH_STREAM,
    JOB_DISPATCH_TOPIC, JOB_PAUSED_TOPIC, JOB_RESUMED_TOPIC, JOB_UPDATED_TOPIC,
};
use shipwright_core::{
    ExecutionStatus, HandlerType, JobExecution, JobStats, JobStatus, JobType, ScheduledJob,
    TaskPriority, ValidationError,
};
use shipwright_storage::{JobFilter, OrchestratorStore};

use crate::cron_expr::{next_run_after, validate_cron};
use crate::error::SchedulerError;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Submission parameters shared by all schedule flavors
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub handler_name: String,
    pub handler_type: HandlerType,
    pub payload: serde_json::Value,
    pub timezone: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    pub priority: TaskPriority,
    pub concurrency: u32,
    pub allow_overlap: bool,
    pub tags: Vec<String>,
    pub platform_id: Option<Uuid>,
}

impl JobSpec {
    pub fn new(
        name: impl Into<String>,
        handler_name: impl Into<String>,
        handler_type: HandlerType,
    ) -> Self {
        Self {
            name: name.into(),
            handler_name: handler_name.into(),
            handler_type,
            payload: json!({}),
            timezone: "UTC".to_string(),
            max_retries: 0,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            priority: TaskPriority::Medium,
            concurrency: 1,
            allow_overlap: false,
            tags: Vec::new(),
            platform_id: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Owns job rows and the due-job tick
pub struct JobScheduler {
    store: Arc<dyn OrchestratorStore>,
    bus: Arc<dyn MessageBus>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn OrchestratorStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self { store, bus }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Cron job firing on every match
    pub async fn schedule(
        &self,
        spec: JobSpec,
        cron: &str,
    ) -> Result<ScheduledJob, SchedulerError> {
        validate_cron(cron)?;
        let next_run = next_run_after(cron, &spec.timezone, Utc::now())?;
        let job = self
            .insert(spec, JobType::Cron, Some(cron.to_string()), next_run, None, None, None)
            .await?;
        Ok(job)
    }

    /// One-shot job at a fixed future instant
    pub async fn schedule_once(
        &self,
        spec: JobSpec,
        execute_at: DateTime<Utc>,
    ) -> Result<ScheduledJob, SchedulerError> {
        if execute_at <= Utc::now() {
            return Err(ValidationError::Invalid(
                "execute_at must be in the future".to_string(),
            )
            .into());
        }
        self.insert(spec, JobType::OneTime, None, Some(execute_at), None, None, None)
            .await
    }

    /// Cron job bounded by a window and/or an execution cap
    pub async fn schedule_recurring(
        &self,
        spec: JobSpec,
        cron: &str,
        start_date: DateTime<Utc>,
        end_date: Option<DateTime<Utc>>,
        max_executions: Option<u32>,
    ) -> Result<ScheduledJob, SchedulerError> {
        validate_cron(cron)?;
        if let Some(end) = end_date {
            if end <= start_date {
                return Err(ValidationError::Invalid(
                    "end_date must be after start_date".to_string(),
                )
                .into());
            }
        }

        let from = start_date.max(Utc::now());
        let next_run = next_run_after(cron, &spec.timezone, from)?;
        self.insert(
            spec,
            JobType::Recurring,
            Some(cron.to_string()),
            next_run,
            Some(start_date),
            end_date,
            max_executions,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert(
        &self,
        spec: JobSpec,
        job_type: JobType,
        schedule: Option<String>,
        next_run: Option<DateTime<Utc>>,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
        max_executions: Option<u32>,
    ) -> Result<ScheduledJob, SchedulerError> {
        let now = Utc::now();
        let job = ScheduledJob {
            id: Uuid::now_v7(),
            name: spec.name,
            job_type,
            schedule,
            timezone: spec.timezone,
            next_run,
            start_date,
            end_date,
            max_executions,
            handler_name: spec.handler_name,
            handler_type: spec.handler_type,
            payload: spec.payload,
            max_retries: spec.max_retries,
            retry_delay_ms: spec.retry_delay_ms,
            timeout_ms: spec.timeout_ms,
            priority: spec.priority,
            concurrency: spec.concurrency,
            allow_overlap: spec.allow_overlap,
            stats: JobStats::default(),
            status: JobStatus::Active,
            tags: spec.tags,
            platform_id: spec.platform_id,
            created_at: now,
            updated_at: now,
        };

        self.store.create_job(&job).await?;
        self.publish_lifecycle(JOB_CREATED_TOPIC, &job).await;
        info!(job_id = %job.id, name = %job.name, ?next_run, "job scheduled");
        Ok(job)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Replace a job's cron expression and recompute its next run
    pub async fn reschedule(&self, id: Uuid, cron: &str) -> Result<ScheduledJob, SchedulerError> {
        validate_cron(cron)?;
        let mut job = self.store.get_job(id).await?;
        if job.job_type == JobType::OneTime {
            return Err(ValidationError::Invalid(
                "one-time jobs cannot be rescheduled with a cron expression".to_string(),
            )
            .into());
        }
        job.schedule = Some(cron.to_string());
        job.next_run = next_run_after(cron, &job.timezone, Utc::now())?;
        self.store.update_job(&job).await?;
        self.publish_lifecycle(JOB_UPDATED_TOPIC, &job).await;
        Ok(job)
    }

    pub async fn unschedule(&self, id: Uuid) -> Result<(), SchedulerError> {
        let job = self.store.get_job(id).await?;
        self.store.delete_job(id).await?;
        self.publish_lifecycle(JOB_DELETED_TOPIC, &job).await;
        info!(job_id = %id, "job unscheduled");
        Ok(())
    }

    pub async fn pause(&self, id: Uuid) -> Result<ScheduledJob, SchedulerError> {
        let mut job = self.store.get_job(id).await?;
        if job.status == JobStatus::Cancelled {
            return Err(SchedulerError::JobCancelled(id));
        }
        job.status = JobStatus::Paused;
        self.store.update_job(&job).await?;
        self.publish_lifecycle(JOB_PAUSED_TOPIC, &job).await;
        Ok(job)
    }

    pub async fn resume(&self, id: Uuid) -> Result<ScheduledJob, SchedulerError> {
        let mut job = self.store.get_job(id).await?;
        if job.status == JobStatus::Cancelled {
            return Err(SchedulerError::JobCancelled(id));
        }
        job.status = JobStatus::Active;
        if let Some(cron) = job.schedule.clone() {
            job.next_run = next_run_after(&cron, &job.timezone, Utc::now())?;
        }
        self.store.update_job(&job).await?;
        self.publish_lifecycle(JOB_RESUMED_TOPIC, &job).await;
        Ok(job)
    }

    pub async fn cancel(&self, id: Uuid) -> Result<ScheduledJob, SchedulerError> {
        let mut job = self.store.get_job(id).await?;
        job.status = JobStatus::Cancelled;
        job.next_run = None;
        self.store.update_job(&job).await?;
        self.publish_lifecycle(JOB_CANCELLED_TOPIC, &job).await;
        info!(job_id = %id, "job cancelled");
        Ok(job)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, id: Uuid) -> Result<ScheduledJob, SchedulerError> {
        self.store.get_job(id).await.map_err(Into::into)
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>, SchedulerError> {
        self.store.list_jobs(filter).await.map_err(Into::into)
    }

    pub async fn executions(&self, job_id: Uuid) -> Result<Vec<JobExecution>, SchedulerError> {
        self.store.list_executions(job_id).await.map_err(Into::into)
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Collect due jobs, advance their next runs, publish dispatch events,
    /// and return the jobs the executor should run now. Also returns due
    /// retry executions.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Vec<ScheduledJob>, Vec<JobExecution>), SchedulerError> {
        let mut fires = Vec::new();

        for mut job in self.store.due_jobs(now).await? {
            if self.recurring_finished(&job, now) {
                job.status = JobStatus::Cancelled;
                job.next_run = None;
                self.store.update_job(&job).await?;
                self.publish_lifecycle(JOB_CANCELLED_TOPIC, &job).await;
                info!(job_id = %job.id, "recurring job reached its end; marked inactive");
                continue;
            }

            if !job.allow_overlap && self.has_running_execution(job.id).await? {
                warn!(job_id = %job.id, "skipping fire; previous execution still running");
                // Push next_run forward so the tick does not spin on it
                self.advance_next_run(&mut job, now).await?;
                continue;
            }

            self.advance_next_run(&mut job, now).await?;

            let dispatch = json!({
                "job_id": job.id,
                "name": job.name,
                "scheduled_at": now,
            });
            if let Err(e) = self
                .bus
                .publish_durable(
                    JOB_DISPATCH_TOPIC,
                    JOB_DISPATCH_STREAM,
                    &job.id.to_string(),
                    dispatch.to_string().as_bytes(),
                )
                .await
            {
                warn!(job_id = %job.id, error = %e, "dispatch event publish failed");
            }

            fires.push(job);
        }

        let retries = self
            .store
            .due_retry_executions(now)
            .await?
            .into_iter()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .collect();

        Ok((fires, retries))
    }

    fn recurring_finished(&self, job: &ScheduledJob, now: DateTime<Utc>) -> bool {
        if job.job_type != JobType::Recurring {
            return false;
        }
        let past_end = job.end_date.map(|end| now > end).unwrap_or(false);
        let capped = job
            .max_executions
            .map(|max| job.stats.executions_count >= max as u64)
            .unwrap_or(false);
        past_end || capped
    }

    async fn has_running_execution(&self, job_id: Uuid) -> Result<bool, SchedulerError> {
        Ok(self
            .store
            .list_executions(job_id)
            .await?
            .iter()
            .any(|e| e.status == ExecutionStatus::Running))
    }

    async fn advance_next_run(
        &self,
        job: &mut ScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        job.next_run = match (&job.job_type, &job.schedule) {
            (JobType::OneTime, _) => None,
            (_, Some(cron)) => next_run_after(cron, &job.timezone, now)?,
            (_, None) => None,
        };
        self.store.update_job(job).await?;
        Ok(())
    }

    async fn publish_lifecycle(&self, topic: &str, job: &ScheduledJob) {
        let payload = match serde_json::to_vec(job) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "job event serialization failed");
                return;
            }
        };
        if let Err(e) = self.bus.publish(topic, &job.id.to_string(), &payload).await {
            warn!(job_id = %job.id, topic, error = %e, "job event publish failed");
        }
    }
}
