//! Job execution: handler resolution, timeout race, retries with backoff,
//! rolling stats

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use shipwright_bus::MessageBus;
use shipwright_core::topics::{
    EXECUTION_FAILED_TOPIC, EXECUTION_RETRY_TOPIC, EXECUTION_SUCCESS_TOPIC, JOB_RESULTS_STREAM,
};
use shipwright_core::{ExecutionStatus, HandlerType, JobExecution, ScheduledJob};
use shipwright_storage::OrchestratorStore;

use crate::error::SchedulerError;
use crate::handlers::{AgentJobGateway, HandlerRegistry, WorkflowGateway};

const BACKOFF_MULTIPLIER: u64 = 2;
const MAX_RETRY_DELAY_MS: u64 = 3_600_000;

/// Jitter factor applied to computed delays (plus or minus 10%)
const RETRY_JITTER: f64 = 0.1;

/// Retry delay for attempt `n` (1-based): `delay * multiplier^(n-1)`,
/// clamped to an hour
pub(crate) fn retry_delay_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    let factor = BACKOFF_MULTIPLIER.saturating_pow(attempt.saturating_sub(1));
    base_delay_ms
        .saturating_mul(factor)
        .min(MAX_RETRY_DELAY_MS)
}

/// Randomize a delay so mass retries don't land on the same instant; the
/// result stays within the clamp
pub(crate) fn jittered_delay_ms(delay_ms: u64) -> u64 {
    if delay_ms == 0 {
        return 0;
    }
    let range = delay_ms as f64 * RETRY_JITTER;
    let offset = rand::thread_rng().gen_range(-range..range);
    (delay_ms as f64 + offset).clamp(0.0, MAX_RETRY_DELAY_MS as f64) as u64
}

/// What one run produced
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execution: JobExecution,
    /// Set when a retry was scheduled
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Runs job fires and retry attempts
pub struct JobExecutor {
    store: Arc<dyn OrchestratorStore>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<HandlerRegistry>,
    agent_gateway: Option<Arc<dyn AgentJobGateway>>,
    workflow_gateway: Option<Arc<dyn WorkflowGateway>>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        bus: Arc<dyn MessageBus>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            agent_gateway: None,
            workflow_gateway: None,
        }
    }

    pub fn with_agent_gateway(mut self, gateway: Arc<dyn AgentJobGateway>) -> Self {
        self.agent_gateway = Some(gateway);
        self
    }

    pub fn with_workflow_gateway(mut self, gateway: Arc<dyn WorkflowGateway>) -> Self {
        self.workflow_gateway = Some(gateway);
        self
    }

    /// Run a fresh fire of a job
    pub async fn execute_job(
        &self,
        job: &ScheduledJob,
    ) -> Result<ExecutionReport, SchedulerError> {
        let execution = JobExecution {
            id: Uuid::now_v7(),
            job_id: job.id,
            status: ExecutionStatus::Running,
            scheduled_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
            error_stack: None,
            retry_count: 0,
            max_retries: job.max_retries,
            next_retry_at: None,
            trace_id: Some(Uuid::new_v4()),
            span_id: None,
        };
        self.store.create_execution(&execution).await?;
        self.run(job, execution).await
    }

    /// Run a previously scheduled retry attempt
    pub async fn execute_retry(
        &self,
        mut execution: JobExecution,
    ) -> Result<ExecutionReport, SchedulerError> {
        let job = self.store.get_job(execution.job_id).await?;
        if job.status == shipwright_core::JobStatus::Cancelled {
            execution.status = ExecutionStatus::Failed;
            execution.error = Some("job cancelled before retry ran".to_string());
            execution.completed_at = Some(Utc::now());
            self.store.update_execution(&execution).await?;
            return Ok(ExecutionReport {
                execution,
                next_retry_at: None,
            });
        }

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        self.store.update_execution(&execution).await?;
        self.run(&job, execution).await
    }

    async fn run(
        &self,
        job: &ScheduledJob,
        mut execution: JobExecution,
    ) -> Result<ExecutionReport, SchedulerError> {
        let started = Utc::now();
        let timeout = Duration::from_millis(job.timeout_ms);

        // Race the handler against the timeout; on expiry the handler is
        // abandoned, not interrupted.
        let outcome = match tokio::time::timeout(timeout, self.resolve_and_run(job)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerFailure {
                message: format!("execution timed out after {}ms", job.timeout_ms),
                timed_out: true,
            }),
        };

        let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
        execution.duration_ms = Some(duration_ms);
        execution.completed_at = Some(Utc::now());

        let report = match outcome {
            Ok(result) => {
                execution.status = ExecutionStatus::Success;
                execution.result = Some(result);
                self.store.update_execution(&execution).await?;
                self.log_execution(execution.id, "info", &format!("succeeded in {duration_ms}ms"))
                    .await;
                self.publish_result(EXECUTION_SUCCESS_TOPIC, job, &execution).await;
                info!(job_id = %job.id, execution_id = %execution.id, duration_ms, "job execution succeeded");
                ExecutionReport {
                    execution,
                    next_retry_at: None,
                }
            }
            Err(failure) => {
                execution.status = if failure.timed_out {
                    ExecutionStatus::Timeout
                } else {
                    ExecutionStatus::Failed
                };
                execution.error = Some(failure.message.clone());

                let next_retry_at = if execution.retry_count < job.max_retries {
                    let attempt = execution.retry_count + 1;
                    let delay = jittered_delay_ms(retry_delay_ms(job.retry_delay_ms, attempt));
                    let at = Utc::now() + chrono::Duration::milliseconds(delay as i64);
                    execution.next_retry_at = Some(at);
                    Some(at)
                } else {
                    None
                };

                self.store.update_execution(&execution).await?;
                self.log_execution(execution.id, "error", &failure.message).await;

                match next_retry_at {
                    Some(at) => {
                        let retry = JobExecution {
                            id: Uuid::now_v7(),
                            job_id: job.id,
                            status: ExecutionStatus::Pending,
                            scheduled_at: at,
                            started_at: None,
                            completed_at: None,
                            duration_ms: None,
                            result: None,
                            error: None,
                            error_stack: None,
                            retry_count: execution.retry_count + 1,
                            max_retries: job.max_retries,
                            next_retry_at: None,
                            trace_id: execution.trace_id,
                            span_id: None,
                        };
                        self.store.create_execution(&retry).await?;
                        self.publish_result(EXECUTION_RETRY_TOPIC, job, &execution).await;
                        warn!(
                            job_id = %job.id,
                            execution_id = %execution.id,
                            retry_count = retry.retry_count,
                            next_retry_at = %at,
                            "job execution failed; retry scheduled"
                        );
                    }
                    None => {
                        self.publish_result(EXECUTION_FAILED_TOPIC, job, &execution).await;
                        warn!(
                            job_id = %job.id,
                            execution_id = %execution.id,
                            error = %failure.message,
                            "job execution permanently failed"
                        );
                    }
                }

                ExecutionReport {
                    execution,
                    next_retry_at,
                }
            }
        };

        // Stats updates must never fail the operation
        let mut stats = match self.store.get_job(job.id).await {
            Ok(fresh) => fresh.stats,
            Err(_) => job.stats,
        };
        stats.record(
            report.execution.status == ExecutionStatus::Success,
            duration_ms,
        );
        if let Err(e) = self.store.update_job_stats(job.id, &stats).await {
            warn!(job_id = %job.id, error = %e, "stats update failed");
        }

        Ok(report)
    }

    async fn resolve_and_run(
        &self,
        job: &ScheduledJob,
    ) -> Result<serde_json::Value, HandlerFailure> {
        match job.handler_type {
            HandlerType::Function => {
                let handler = self
                    .registry
                    .get(&job.handler_name)
                    .ok_or_else(|| HandlerFailure::new(format!(
                        "no handler registered under {:?}",
                        job.handler_name
                    )))?;
                handler.run(&job.payload).await.map_err(HandlerFailure::new)
            }

            HandlerType::Agent => {
                let gateway = self
                    .agent_gateway
                    .as_ref()
                    .ok_or_else(|| HandlerFailure::new("no agent gateway configured"))?;
                let agent_type = job
                    .payload
                    .get("agent_type")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| HandlerFailure::new("payload missing agent_type"))?;
                gateway
                    .dispatch_agent(agent_type, &job.payload)
                    .await
                    .map_err(HandlerFailure::new)?;
                Ok(json!({ "dispatched": true, "agent_type": agent_type }))
            }

            HandlerType::Workflow => {
                let gateway = self
                    .workflow_gateway
                    .as_ref()
                    .ok_or_else(|| HandlerFailure::new("no workflow gateway configured"))?;
                let workflow_id = gateway
                    .submit_workflow(&job.payload)
                    .await
                    .map_err(HandlerFailure::new)?;
                Ok(json!({ "workflow_id": workflow_id }))
            }
        }
    }

    /// Log lines are best-effort and never fail the run
    async fn log_execution(&self, execution_id: Uuid, level: &str, message: &str) {
        if let Err(e) = self
            .store
            .append_execution_log(execution_id, level, message)
            .await
        {
            warn!(%execution_id, error = %e, "execution log write failed");
        }
    }

    async fn publish_result(&self, topic: &str, job: &ScheduledJob, execution: &JobExecution) {
        let payload = json!({
            "job_id": job.id,
            "execution_id": execution.id,
            "status": execution.status,
            "duration_ms": execution.duration_ms,
            "error": execution.error,
            "retry_count": execution.retry_count,
        });
        if let Err(e) = self
            .bus
            .publish_durable(
                topic,
                JOB_RESULTS_STREAM,
                &job.id.to_string(),
                payload.to_string().as_bytes(),
            )
            .await
        {
            warn!(job_id = %job.id, topic, error = %e, "execution event publish failed");
        }
    }
}

struct HandlerFailure {
    message: String,
    timed_out: bool,
}

impl HandlerFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }
}
