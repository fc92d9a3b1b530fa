//! Workflow service: public API and the exactly-once result pipeline
//!
//! Every agent result passes through, in order: schema validation, a
//! collision-proof event id, the Redis dedup set, the per-task distributed
//! lock, the defensive stage-mismatch gate, the in-memory backstop, output
//! persistence, the FSM, a compare-and-swap stage advance, a
//! wait-for-transition poll, and the next dispatch. At most one delivery of
//! any result ever transitions the workflow; everything else is dropped by
//! one of the gates and counted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use shipwright_bus::{KvStore, MessageBus, TaskLock};
use shipwright_core::topics::{seen_set_key, task_lock_key, WORKFLOW_EVENTS_TOPIC};
use shipwright_core::{
    event_id, AgentType, CreateWorkflow, OrchestratorConfig, ResultEnvelope, StageOutput, Task,
    TaskPriority, TaskStatus, ValidationError, Workflow, WorkflowEventMessage, WorkflowLifecycle,
    WorkflowStatus,
};
use shipwright_definitions::DefinitionEngine;
use shipwright_storage::{OrchestratorStore, StoreError};

use crate::dispatcher::{AgentDispatcher, ResultHandler};
use crate::envelope_builder::EnvelopeBuilder;
use crate::error::EngineError;
use crate::fsm::{FsmEffect, FsmEvent, FsmRegistry};

const DEFAULT_TASK_MAX_RETRIES: u32 = 3;

/// Rolling drop/processing counters for the result pipeline
///
/// Never reset in-process; the aggregator snapshots them.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub results_processed: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub lock_contention_dropped: AtomicU64,
    pub conflicts_dropped: AtomicU64,
    pub schema_dropped: AtomicU64,
    pub failures_recorded: AtomicU64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "results_processed": self.results_processed.load(Ordering::Relaxed),
            "duplicates_dropped": self.duplicates_dropped.load(Ordering::Relaxed),
            "stale_dropped": self.stale_dropped.load(Ordering::Relaxed),
            "lock_contention_dropped": self.lock_contention_dropped.load(Ordering::Relaxed),
            "conflicts_dropped": self.conflicts_dropped.load(Ordering::Relaxed),
            "schema_dropped": self.schema_dropped.load(Ordering::Relaxed),
            "failures_recorded": self.failures_recorded.load(Ordering::Relaxed),
        })
    }
}

/// What the pipeline did with one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultOutcome {
    /// The result transitioned the workflow (or completed it)
    Applied {
        workflow_id: Uuid,
        next_stage: Option<String>,
    },
    /// Dropped by the dedup set or the in-memory backstop
    Duplicate,
    /// Dropped because another worker holds the task lock
    LockBusy,
    /// Dropped by the stage-mismatch gate
    Stale,
    /// Dropped because the CAS advance lost
    Conflict,
    /// Failed result with budget left; the stage was re-queued
    RetryQueued { retry_count: u32 },
    /// Failed result with retries exhausted; workflow failed
    WorkflowFailed,
}

/// The orchestrator's public workflow API and result pipeline
pub struct WorkflowService {
    store: Arc<dyn OrchestratorStore>,
    kv: Arc<dyn KvStore>,
    bus: Arc<dyn MessageBus>,
    definitions: Arc<DefinitionEngine>,
    dispatcher: Arc<AgentDispatcher>,
    builder: EnvelopeBuilder,
    fsm: FsmRegistry,
    config: OrchestratorConfig,
    counters: PipelineCounters,
    /// Best-effort second line of defense: task ids applied this process
    processed_tasks: Mutex<HashSet<Uuid>>,
}

impl WorkflowService {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        kv: Arc<dyn KvStore>,
        bus: Arc<dyn MessageBus>,
        definitions: Arc<DefinitionEngine>,
        dispatcher: Arc<AgentDispatcher>,
        builder: EnvelopeBuilder,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            kv,
            bus,
            definitions,
            dispatcher,
            builder,
            fsm: FsmRegistry::new(),
            config,
            counters: PipelineCounters::default(),
            processed_tasks: Mutex::new(HashSet::new()),
        })
    }

    /// Register the persistent result handler with the dispatcher
    ///
    /// Called once at startup; this is the only result callback in the
    /// system.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let handler = Arc::new(ServiceResultHandler {
            service: self.clone(),
        });
        self.dispatcher.start_result_subscriber(handler).await
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.counters
    }

    // =========================================================================
    // Public workflow API
    // =========================================================================

    /// Create a workflow and dispatch its first stage
    #[instrument(skip(self, input), fields(workflow_type = %input.workflow_type))]
    pub async fn create_workflow(&self, input: CreateWorkflow) -> Result<Workflow, EngineError> {
        let definition = self
            .definitions
            .resolve(input.platform_id, input.workflow_type)
            .await?
            .ok_or_else(|| {
                ValidationError::UnknownWorkflowType(input.workflow_type.to_string())
            })?;

        let first_stage = self
            .definitions
            .first_stage(&definition, &serde_json::Map::new())
            .ok_or_else(|| ValidationError::Invalid("definition has no runnable stage".into()))?
            .name
            .clone();

        let progress = self
            .definitions
            .progress(input.platform_id, input.workflow_type, &first_stage)
            .await?
            .progress_percentage;

        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::now_v7(),
            workflow_type: input.workflow_type,
            platform_id: input.platform_id,
            status: WorkflowStatus::Initiated,
            current_stage: first_stage.clone(),
            progress,
            stage_outputs: vec![],
            version: 1,
            name: input.name,
            description: input.description,
            requirements: input.requirements,
            created_by: input.created_by,
            trace_id: Uuid::new_v4(),
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        self.store.create_workflow(&workflow).await?;
        info!(workflow_id = %workflow.id, workflow_type = %workflow.workflow_type, stage = %first_stage, "workflow created");

        self.publish_lifecycle(&workflow, WorkflowLifecycle::Created, None)
            .await;

        let effects = self.fsm.apply(
            &workflow,
            FsmEvent::Start {
                first_stage: first_stage.clone(),
            },
        )?;
        for effect in effects {
            if let FsmEffect::DispatchStage { stage } = effect {
                self.dispatch_stage(&workflow, &stage, 0).await?;
            }
        }

        self.store
            .set_workflow_status(workflow.id, WorkflowStatus::Running, None)
            .await?;

        self.store.get_workflow(workflow.id).await.map_err(Into::into)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        self.store.get_workflow(id).await.map_err(Into::into)
    }

    pub async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>, EngineError> {
        self.store.list_workflows(status).await.map_err(Into::into)
    }

    pub async fn workflow_tasks(&self, id: Uuid) -> Result<Vec<Task>, EngineError> {
        self.store.list_tasks(id).await.map_err(Into::into)
    }

    /// Cancel unconditionally (terminal workflows excepted)
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        let workflow = self.store.get_workflow(id).await?;
        if workflow.status.is_terminal() {
            return Err(EngineError::Terminal(id));
        }

        self.fsm.apply(&workflow, FsmEvent::Cancel)?;
        self.store
            .set_workflow_status(id, WorkflowStatus::Cancelled, None)
            .await?;

        // Orphan any in-flight attempts
        for task in self.store.list_tasks(id).await? {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
                self.store
                    .update_task_status(task.id, TaskStatus::Cancelled)
                    .await?;
            }
        }

        info!(workflow_id = %id, "workflow cancelled");
        self.store.get_workflow(id).await.map_err(Into::into)
    }

    /// Re-dispatch the current stage of a failed workflow
    #[instrument(skip(self))]
    pub async fn retry_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        let workflow = self.store.get_workflow(id).await?;
        if workflow.status != WorkflowStatus::Failed {
            return Err(ValidationError::Invalid(format!(
                "only failed workflows can be retried (status is {})",
                workflow.status
            ))
            .into());
        }

        // The live FSM (if any) is terminal; reseed from the reset row
        self.fsm.remove(id);
        self.store
            .set_workflow_status(id, WorkflowStatus::Running, None)
            .await?;

        let reset = self.store.get_workflow(id).await?;
        self.dispatch_stage(&reset, &reset.current_stage.clone(), 0)
            .await?;
        self.publish_lifecycle(&reset, WorkflowLifecycle::Resumed, None)
            .await;

        info!(workflow_id = %id, stage = %reset.current_stage, "workflow retried");
        Ok(reset)
    }

    // =========================================================================
    // Decision / clarification gates
    // =========================================================================

    pub async fn require_decision(&self, id: Uuid, decision_id: &str) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(id).await?;
        let effects = self.fsm.apply(
            &workflow,
            FsmEvent::DecisionRequired {
                id: decision_id.to_string(),
            },
        )?;
        if !effects.is_empty() {
            self.store
                .set_workflow_status(id, WorkflowStatus::Paused, None)
                .await?;
            self.publish_lifecycle(&workflow, WorkflowLifecycle::Paused, None)
                .await;
        }
        Ok(())
    }

    pub async fn approve_decision(&self, id: Uuid, decision_id: &str) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(id).await?;
        let effects = self.fsm.apply(
            &workflow,
            FsmEvent::DecisionApproved {
                id: decision_id.to_string(),
            },
        )?;
        self.resume_from_pause(id, effects).await
    }

    pub async fn reject_decision(
        &self,
        id: Uuid,
        decision_id: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(id).await?;
        let effects = self.fsm.apply(
            &workflow,
            FsmEvent::DecisionRejected {
                id: decision_id.to_string(),
                reason: reason.to_string(),
            },
        )?;
        for effect in effects {
            if let FsmEffect::WorkflowFailed { error } = effect {
                self.store
                    .set_workflow_status(id, WorkflowStatus::Failed, Some(&error))
                    .await?;
                let failed = self.store.get_workflow(id).await?;
                self.publish_lifecycle(&failed, WorkflowLifecycle::Failed, Some(error))
                    .await;
            }
        }
        Ok(())
    }

    pub async fn require_clarification(
        &self,
        id: Uuid,
        clarification_id: &str,
    ) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(id).await?;
        let effects = self.fsm.apply(
            &workflow,
            FsmEvent::ClarificationRequired {
                id: clarification_id.to_string(),
            },
        )?;
        if !effects.is_empty() {
            self.store
                .set_workflow_status(id, WorkflowStatus::Paused, None)
                .await?;
            self.publish_lifecycle(&workflow, WorkflowLifecycle::Paused, None)
                .await;
        }
        Ok(())
    }

    pub async fn complete_clarification(
        &self,
        id: Uuid,
        clarification_id: &str,
    ) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(id).await?;
        let effects = self.fsm.apply(
            &workflow,
            FsmEvent::ClarificationComplete {
                id: clarification_id.to_string(),
            },
        )?;
        self.resume_from_pause(id, effects).await
    }

    async fn resume_from_pause(
        &self,
        id: Uuid,
        effects: Vec<FsmEffect>,
    ) -> Result<(), EngineError> {
        for effect in effects {
            if let FsmEffect::WorkflowResumed { stage } = effect {
                self.store
                    .set_workflow_status(id, WorkflowStatus::Running, None)
                    .await?;
                let workflow = self.store.get_workflow(id).await?;
                self.dispatch_stage(&workflow, &stage, 0).await?;
                self.publish_lifecycle(&workflow, WorkflowLifecycle::Resumed, None)
                    .await;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Exactly-once result pipeline
    // =========================================================================

    /// Process one raw delivery from the result topic
    #[instrument(skip(self, payload))]
    pub async fn handle_agent_result(
        &self,
        payload: &[u8],
    ) -> Result<ResultOutcome, EngineError> {
        // Step 1: schema validation. Failures are fatal for the delivery;
        // the bus message is acknowledged either way.
        let envelope = match ResultEnvelope::parse(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.schema_dropped.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        // Step 2: collision-proof event id
        let event_id = event_id(
            envelope.result.task_id,
            &envelope.stage,
            envelope.result.timestamp,
            &envelope.result.agent_id,
        );

        let task_id = envelope.result.task_id;
        let seen_key = seen_set_key(task_id);

        // Step 3: dedup against already-applied event ids
        if self.kv.sismember(&seen_key, &event_id).await? {
            self.counters
                .duplicates_dropped
                .fetch_add(1, Ordering::Relaxed);
            info!(%task_id, %event_id, "duplicate result dropped");
            return Ok(ResultOutcome::Duplicate);
        }

        // Step 4: per-task distributed lock
        let Some(lock) = TaskLock::acquire(
            self.kv.clone(),
            task_lock_key(task_id),
            self.config.lock_ttl,
        )
        .await?
        else {
            self.counters
                .lock_contention_dropped
                .fetch_add(1, Ordering::Relaxed);
            info!(%task_id, "task lock busy; another worker is processing");
            return Ok(ResultOutcome::LockBusy);
        };

        let outcome = self.process_locked(&envelope, &event_id).await;

        // Step 13: release; TTL expiry is tolerated
        if let Err(e) = lock.release().await {
            warn!(%task_id, error = %e, "lock release failed");
        }

        outcome
    }

    /// Steps 5-12, run while holding the task lock
    async fn process_locked(
        &self,
        envelope: &ResultEnvelope,
        event_id: &str,
    ) -> Result<ResultOutcome, EngineError> {
        let task_id = envelope.result.task_id;
        let workflow_id = envelope.workflow_id;

        // Step 5: reload and run the defensive stage-mismatch gate
        let workflow = self.store.get_workflow(workflow_id).await?;
        self.log_truth_table(&envelope.result.status, task_id, &envelope.stage, &workflow);

        if workflow.status.is_terminal() || workflow.current_stage != envelope.stage {
            self.counters.stale_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(ResultOutcome::Stale);
        }

        // Step 6: in-memory idempotency backstop
        if self.processed_tasks.lock().contains(&task_id) {
            self.counters
                .duplicates_dropped
                .fetch_add(1, Ordering::Relaxed);
            info!(%task_id, "backstop drop: task already applied in this process");
            return Ok(ResultOutcome::Duplicate);
        }

        if envelope.result.success {
            self.apply_success(envelope, event_id, workflow).await
        } else {
            self.apply_failure(envelope, event_id, workflow).await
        }
    }

    async fn apply_success(
        &self,
        envelope: &ResultEnvelope,
        event_id: &str,
        workflow: Workflow,
    ) -> Result<ResultOutcome, EngineError> {
        let task_id = envelope.result.task_id;
        let stage = envelope.stage.clone();

        // Step 7: persist the stage output
        let output = StageOutput {
            stage: stage.clone(),
            output: envelope
                .result
                .result
                .clone()
                .unwrap_or(serde_json::Value::Null),
            completed_at: Utc::now(),
        };
        self.store
            .append_stage_output(workflow.id, &output)
            .await?;

        // Step 8: the attempt is done
        self.store
            .update_task_status(task_id, TaskStatus::Completed)
            .await?;

        // Step 9: advance the FSM behind a CAS update
        let mut outputs = workflow.outputs_by_stage();
        outputs.insert(stage.clone(), output.output.clone());
        let next = self
            .definitions
            .next_stage(
                workflow.platform_id,
                workflow.workflow_type,
                &stage,
                &outputs,
            )
            .await?;

        self.fsm.apply(
            &workflow,
            FsmEvent::StageComplete {
                stage: stage.clone(),
                event_id: event_id.to_string(),
                next_stage: next.next_stage.clone(),
            },
        )?;

        let advanced = match &next.next_stage {
            Some(next_stage) => {
                self.store
                    .advance_stage(
                        workflow.id,
                        &stage,
                        workflow.version,
                        next_stage,
                        next.expected_progress,
                        WorkflowStatus::Running,
                    )
                    .await?
            }
            None => {
                self.store
                    .advance_stage(
                        workflow.id,
                        &stage,
                        workflow.version,
                        &stage,
                        100,
                        WorkflowStatus::Completed,
                    )
                    .await?
            }
        };

        if !advanced {
            // Another worker won the race; our FSM view is stale
            self.counters
                .conflicts_dropped
                .fetch_add(1, Ordering::Relaxed);
            self.fsm.remove(workflow.id);
            warn!(workflow_id = %workflow.id, %stage, "CAS lost; dropping result");
            return Ok(ResultOutcome::Conflict);
        }

        // Step 10: tolerate asynchronous side effects before dispatching
        self.wait_for_transition(workflow.id, &stage).await?;

        let current = self.store.get_workflow(workflow.id).await?;
        self.publish_lifecycle(&current, WorkflowLifecycle::StageCompleted, None)
            .await;

        // Step 11: dispatch the next stage while the workflow lives
        if let Some(next_stage) = &next.next_stage {
            if let Err(e) = self.dispatch_stage(&current, next_stage, 0).await {
                // Dispatch failure propagates STAGE_FAILED into the FSM
                let message = e.to_string();
                error!(workflow_id = %workflow.id, stage = %next_stage, error = %message, "next-stage dispatch failed");
                let _ = self.fsm.apply(
                    &current,
                    FsmEvent::StageFailed {
                        stage: next_stage.clone(),
                        error: message.clone(),
                        retries_exhausted: true,
                    },
                );
                self.store
                    .set_workflow_status(workflow.id, WorkflowStatus::Failed, Some(&message))
                    .await?;
                let failed = self.store.get_workflow(workflow.id).await?;
                self.publish_lifecycle(&failed, WorkflowLifecycle::Failed, Some(message))
                    .await;
                self.track_event(task_id, event_id).await;
                return Err(e);
            }
        } else {
            self.publish_lifecycle(&current, WorkflowLifecycle::Completed, None)
                .await;
            info!(workflow_id = %workflow.id, "workflow completed");
        }

        // Step 12: record the applied event id and arm the backstop
        self.processed_tasks.lock().insert(task_id);
        self.track_event(task_id, event_id).await;
        self.counters
            .results_processed
            .fetch_add(1, Ordering::Relaxed);

        Ok(ResultOutcome::Applied {
            workflow_id: workflow.id,
            next_stage: next.next_stage,
        })
    }

    async fn apply_failure(
        &self,
        envelope: &ResultEnvelope,
        event_id: &str,
        workflow: Workflow,
    ) -> Result<ResultOutcome, EngineError> {
        let task_id = envelope.result.task_id;
        let stage = envelope.stage.clone();
        let message = envelope
            .result
            .error
            .clone()
            .unwrap_or_else(|| "agent reported failure".to_string());

        self.store
            .update_task_status(task_id, TaskStatus::Failed)
            .await?;

        let task = self.store.get_task(task_id).await?;
        let exhausted = task.retries_exhausted();

        self.fsm.apply(
            &workflow,
            FsmEvent::StageFailed {
                stage: stage.clone(),
                error: message.clone(),
                retries_exhausted: exhausted,
            },
        )?;

        let outcome = if exhausted {
            self.store
                .set_workflow_status(workflow.id, WorkflowStatus::Failed, Some(&message))
                .await?;
            let failed = self.store.get_workflow(workflow.id).await?;
            self.publish_lifecycle(&failed, WorkflowLifecycle::Failed, Some(message.clone()))
                .await;
            self.counters
                .failures_recorded
                .fetch_add(1, Ordering::Relaxed);
            warn!(workflow_id = %workflow.id, %stage, error = %message, "stage retries exhausted; workflow failed");
            ResultOutcome::WorkflowFailed
        } else {
            // Retry within the stage: same task, bumped attempt, no FSM move
            let retry_count = self.store.increment_task_retry(task_id).await?;
            let retried = self.store.get_task(task_id).await?;
            let retry_envelope = self.builder.build(&retried, &workflow)?;
            self.dispatcher.dispatch(&retry_envelope).await?;
            info!(workflow_id = %workflow.id, %stage, retry_count, "stage re-queued after failure");
            ResultOutcome::RetryQueued { retry_count }
        };

        self.track_event(task_id, event_id).await;
        Ok(outcome)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Create, persist, and dispatch one task attempt for a stage
    async fn dispatch_stage(
        &self,
        workflow: &Workflow,
        stage_name: &str,
        retry_count: u32,
    ) -> Result<Task, EngineError> {
        let definition = self
            .definitions
            .resolve(workflow.platform_id, workflow.workflow_type)
            .await?
            .ok_or_else(|| {
                ValidationError::UnknownWorkflowType(workflow.workflow_type.to_string())
            })?;
        let stage = definition
            .stage(stage_name)
            .ok_or_else(|| {
                ValidationError::Invalid(format!("stage {stage_name:?} not in definition"))
            })?
            .clone();

        let mut task = Task {
            id: Uuid::now_v7(),
            workflow_id: workflow.id,
            agent_type: stage.agent_type,
            action: action_for(stage.agent_type, stage_name),
            stage: stage_name.to_string(),
            status: TaskStatus::Pending,
            retry_count,
            max_retries: DEFAULT_TASK_MAX_RETRIES,
            timeout_ms: stage.timeout_ms,
            priority: TaskPriority::Medium,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
            completed_at: None,
        };

        let envelope = self.builder.build(&task, workflow)?;
        task.payload = serde_json::to_value(&envelope)?;
        self.store.create_task(&task).await?;

        self.dispatcher.dispatch(&envelope).await?;
        info!(workflow_id = %workflow.id, task_id = %task.id, stage = %stage_name, agent_type = %stage.agent_type, "stage dispatched");
        Ok(task)
    }

    /// Step 10: poll until the row left `previous_stage` (or went terminal)
    async fn wait_for_transition(
        &self,
        workflow_id: Uuid,
        previous_stage: &str,
    ) -> Result<(), EngineError> {
        for _ in 0..self.config.transition_poll_attempts {
            let workflow = self.store.get_workflow(workflow_id).await?;
            if workflow.current_stage != previous_stage || workflow.status.is_terminal() {
                return Ok(());
            }
            tokio::time::sleep(self.config.transition_poll_interval).await;
        }
        warn!(%workflow_id, previous_stage, "transition not observed within poll budget");
        Ok(())
    }

    async fn track_event(&self, task_id: Uuid, event_id: &str) {
        if let Err(e) = self
            .kv
            .sadd_with_ttl(&seen_set_key(task_id), event_id, self.config.dedup_ttl)
            .await
        {
            warn!(%task_id, event_id, error = %e, "failed to record event id");
        }
    }

    async fn publish_lifecycle(
        &self,
        workflow: &Workflow,
        lifecycle: WorkflowLifecycle,
        error: Option<String>,
    ) {
        let message = WorkflowEventMessage::new(workflow, lifecycle, error);
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(workflow_id = %workflow.id, error = %e, "lifecycle event serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .bus
            .publish(
                WORKFLOW_EVENTS_TOPIC,
                &workflow.id.to_string(),
                &payload,
            )
            .await
        {
            warn!(workflow_id = %workflow.id, error = %e, "lifecycle event publish failed");
        }
    }

    /// One truth-table entry per observed result
    fn log_truth_table(
        &self,
        event_type: &str,
        task_id: Uuid,
        event_stage: &str,
        workflow: &Workflow,
    ) {
        let stage_match = workflow.current_stage == event_stage && !workflow.status.is_terminal();
        if stage_match {
            info!(
                target: "truth_table",
                worker_id = %self.config.worker_id,
                %task_id,
                workflow_id = %workflow.id,
                event_type,
                event_stage,
                db_current_stage = %workflow.current_stage,
                db_status = %workflow.status,
                db_progress = workflow.progress,
                stage_match = "YES",
                severity = "INFO",
                "agent result observed"
            );
        } else {
            error!(
                target: "truth_table",
                worker_id = %self.config.worker_id,
                %task_id,
                workflow_id = %workflow.id,
                event_type,
                event_stage,
                db_current_stage = %workflow.current_stage,
                db_status = %workflow.status,
                db_progress = workflow.progress,
                stage_match = "NO",
                severity = "CRITICAL",
                "stale agent result dropped"
            );
        }
    }
}

/// The one persistent handler registered with the dispatcher
struct ServiceResultHandler {
    service: Arc<WorkflowService>,
}

#[async_trait]
impl ResultHandler for ServiceResultHandler {
    async fn handle(&self, payload: &[u8]) {
        // Best-effort-forever: a failing handler must not kill the
        // subscription, so every error stops here.
        match self.service.handle_agent_result(payload).await {
            Ok(outcome) => {
                tracing::debug!(?outcome, "result handled");
            }
            Err(EngineError::Store(StoreError::WorkflowNotFound(id))) => {
                warn!(workflow_id = %id, "result for unknown workflow dropped");
            }
            Err(e) => {
                error!(error = %e, "result handling failed; message dropped");
            }
        }
    }
}

fn action_for(agent_type: AgentType, stage: &str) -> String {
    match agent_type {
        AgentType::Scaffold => {
            if stage == "initialization" {
                "initialize".to_string()
            } else {
                "scaffold".to_string()
            }
        }
        AgentType::Validation => "validate".to_string(),
        AgentType::E2e => "run_e2e".to_string(),
        AgentType::Integration => "integrate".to_string(),
        AgentType::Deployment => "deploy".to_string(),
    }
}
