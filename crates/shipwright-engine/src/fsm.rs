//! Per-workflow state machine
//!
//! The FSM is synchronous bookkeeping: events go in, effects come out, and
//! the service performs the I/O the effects call for (CAS update, dispatch,
//! lifecycle publish). Instances are not thread-safe; the registry's local
//! mutex guards the map, and the per-task distributed lock serializes
//! mutations of any one instance. Neither lock is ever held across an await.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use shipwright_core::{Workflow, WorkflowStatus};

/// FSM state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmState {
    Created,
    Running { stage: String },
    PausedForDecision { id: String, stage: String },
    PausedForClarification { id: String, stage: String },
    Completed,
    Failed { stage: Option<String> },
    Cancelled,
}

impl FsmState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Cancelled)
    }

    /// Seed an FSM from a persisted workflow row
    pub fn from_workflow(workflow: &Workflow) -> Self {
        match workflow.status {
            WorkflowStatus::Initiated => Self::Created,
            WorkflowStatus::Running => Self::Running {
                stage: workflow.current_stage.clone(),
            },
            // Persisted rows do not distinguish the two pause flavors; a
            // decision pause is re-entered via its event
            WorkflowStatus::Paused => Self::PausedForDecision {
                id: String::new(),
                stage: workflow.current_stage.clone(),
            },
            WorkflowStatus::Completed => Self::Completed,
            WorkflowStatus::Failed => Self::Failed {
                stage: Some(workflow.current_stage.clone()),
            },
            WorkflowStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// Events accepted by the FSM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmEvent {
    Start {
        first_stage: String,
    },
    /// `next_stage` is resolved by the caller against the definition engine
    /// before the event is applied; `None` means the stage was the last one.
    StageComplete {
        stage: String,
        event_id: String,
        next_stage: Option<String>,
    },
    StageFailed {
        stage: String,
        error: String,
        retries_exhausted: bool,
    },
    DecisionRequired {
        id: String,
    },
    DecisionApproved {
        id: String,
    },
    DecisionRejected {
        id: String,
        reason: String,
    },
    ClarificationRequired {
        id: String,
    },
    ClarificationComplete {
        id: String,
    },
    Retry,
    Cancel,
}

/// Side effects for the service to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmEffect {
    /// Advance persisted state and dispatch the named stage
    DispatchStage { stage: String },
    /// Re-queue the same stage with an incremented retry count
    RetryStage { stage: String },
    WorkflowCompleted,
    WorkflowFailed { error: String },
    WorkflowCancelled,
    WorkflowPaused,
    WorkflowResumed { stage: String },
}

/// Transition rejections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsmError {
    #[error("stage mismatch: workflow at {expected:?}, event for {got:?}")]
    StageMismatch { expected: String, got: String },

    #[error("no transitions permitted from terminal state")]
    TerminalState,

    #[error("event not valid in state {state}")]
    InvalidTransition { state: String },
}

/// One workflow's state machine
#[derive(Debug, Clone)]
pub struct WorkflowFsm {
    state: FsmState,
}

impl WorkflowFsm {
    pub fn new() -> Self {
        Self {
            state: FsmState::Created,
        }
    }

    pub fn from_state(state: FsmState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &FsmState {
        &self.state
    }

    /// Apply one event, returning the effects the caller must perform
    pub fn apply(&mut self, event: FsmEvent) -> Result<Vec<FsmEffect>, FsmError> {
        if self.state.is_terminal() {
            // CANCEL is unconditional for the non-terminal states only;
            // terminal states accept nothing.
            return Err(FsmError::TerminalState);
        }

        match (&self.state, event) {
            (_, FsmEvent::Cancel) => {
                self.state = FsmState::Cancelled;
                Ok(vec![FsmEffect::WorkflowCancelled])
            }

            (FsmState::Created, FsmEvent::Start { first_stage }) => {
                self.state = FsmState::Running {
                    stage: first_stage.clone(),
                };
                Ok(vec![FsmEffect::DispatchStage { stage: first_stage }])
            }

            (
                FsmState::Running { stage: current },
                FsmEvent::StageComplete {
                    stage,
                    next_stage,
                    ..
                },
            ) => {
                if *current != stage {
                    return Err(FsmError::StageMismatch {
                        expected: current.clone(),
                        got: stage,
                    });
                }
                match next_stage {
                    Some(next) => {
                        self.state = FsmState::Running {
                            stage: next.clone(),
                        };
                        Ok(vec![FsmEffect::DispatchStage { stage: next }])
                    }
                    None => {
                        self.state = FsmState::Completed;
                        Ok(vec![FsmEffect::WorkflowCompleted])
                    }
                }
            }

            (
                FsmState::Running { stage: current },
                FsmEvent::StageFailed {
                    stage,
                    error,
                    retries_exhausted,
                },
            ) => {
                if *current != stage {
                    return Err(FsmError::StageMismatch {
                        expected: current.clone(),
                        got: stage,
                    });
                }
                if retries_exhausted {
                    self.state = FsmState::Failed {
                        stage: Some(stage),
                    };
                    Ok(vec![FsmEffect::WorkflowFailed { error }])
                } else {
                    // Retry within a stage; no state transition
                    Ok(vec![FsmEffect::RetryStage { stage }])
                }
            }

            (FsmState::Running { stage }, FsmEvent::DecisionRequired { id }) => {
                self.state = FsmState::PausedForDecision {
                    id,
                    stage: stage.clone(),
                };
                Ok(vec![FsmEffect::WorkflowPaused])
            }

            // Pausing is idempotent
            (FsmState::PausedForDecision { id: held, .. }, FsmEvent::DecisionRequired { id })
                if *held == id =>
            {
                Ok(vec![])
            }

            (FsmState::PausedForDecision { id: held, stage }, FsmEvent::DecisionApproved { id })
                if held.is_empty() || *held == id =>
            {
                let stage = stage.clone();
                self.state = FsmState::Running {
                    stage: stage.clone(),
                };
                Ok(vec![FsmEffect::WorkflowResumed { stage }])
            }

            (
                FsmState::PausedForDecision { id: held, stage },
                FsmEvent::DecisionRejected { id, reason },
            ) if held.is_empty() || *held == id => {
                self.state = FsmState::Failed {
                    stage: Some(stage.clone()),
                };
                Ok(vec![FsmEffect::WorkflowFailed {
                    error: format!("decision rejected: {reason}"),
                }])
            }

            (FsmState::Running { stage }, FsmEvent::Retry) => {
                let stage = stage.clone();
                Ok(vec![FsmEffect::RetryStage { stage }])
            }

            (FsmState::Running { stage }, FsmEvent::ClarificationRequired { id }) => {
                self.state = FsmState::PausedForClarification {
                    id,
                    stage: stage.clone(),
                };
                Ok(vec![FsmEffect::WorkflowPaused])
            }

            (
                FsmState::PausedForClarification { id: held, .. },
                FsmEvent::ClarificationRequired { id },
            ) if *held == id => Ok(vec![]),

            (
                FsmState::PausedForClarification { id: held, stage },
                FsmEvent::ClarificationComplete { id },
            ) if held.is_empty() || *held == id => {
                let stage = stage.clone();
                self.state = FsmState::Running {
                    stage: stage.clone(),
                };
                Ok(vec![FsmEffect::WorkflowResumed { stage }])
            }

            (state, _) => Err(FsmError::InvalidTransition {
                state: format!("{state:?}"),
            }),
        }
    }
}

impl Default for WorkflowFsm {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyed map of live FSM instances
///
/// Populated lazily from workflow rows, cleared on terminal transitions and
/// on shutdown. The internal mutex is held only for map access.
pub struct FsmRegistry {
    inner: Mutex<HashMap<Uuid, WorkflowFsm>>,
}

impl FsmRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Apply an event to the workflow's FSM, seeding it from the persisted
    /// row when no live instance exists.
    pub fn apply(
        &self,
        workflow: &Workflow,
        event: FsmEvent,
    ) -> Result<Vec<FsmEffect>, FsmError> {
        let mut map = self.inner.lock();
        let fsm = map
            .entry(workflow.id)
            .or_insert_with(|| WorkflowFsm::from_state(FsmState::from_workflow(workflow)));
        let effects = fsm.apply(event);

        // Terminal instances are dead weight; drop them eagerly
        if fsm.state().is_terminal() {
            map.remove(&workflow.id);
        }
        effects
    }

    pub fn state_of(&self, workflow_id: Uuid) -> Option<FsmState> {
        self.inner.lock().get(&workflow_id).map(|f| f.state().clone())
    }

    /// Drop one live instance so the next event reseeds from the store
    /// (used after a lost CAS, when this worker's view is stale)
    pub fn remove(&self, workflow_id: Uuid) {
        self.inner.lock().remove(&workflow_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop all live instances (shutdown)
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for FsmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(stage: &str) -> WorkflowFsm {
        WorkflowFsm::from_state(FsmState::Running {
            stage: stage.to_string(),
        })
    }

    #[test]
    fn test_start_dispatches_first_stage() {
        let mut fsm = WorkflowFsm::new();
        let effects = fsm
            .apply(FsmEvent::Start {
                first_stage: "initialization".to_string(),
            })
            .expect("should start");
        assert_eq!(
            effects,
            vec![FsmEffect::DispatchStage {
                stage: "initialization".to_string()
            }]
        );
        assert_eq!(
            fsm.state(),
            &FsmState::Running {
                stage: "initialization".to_string()
            }
        );
    }

    #[test]
    fn test_stage_complete_advances() {
        let mut fsm = running("initialization");
        let effects = fsm
            .apply(FsmEvent::StageComplete {
                stage: "initialization".to_string(),
                event_id: "abc123def456".to_string(),
                next_stage: Some("scaffolding".to_string()),
            })
            .expect("should advance");
        assert_eq!(
            effects,
            vec![FsmEffect::DispatchStage {
                stage: "scaffolding".to_string()
            }]
        );
    }

    #[test]
    fn test_stage_complete_rejects_mismatch() {
        let mut fsm = running("scaffolding");
        let err = fsm
            .apply(FsmEvent::StageComplete {
                stage: "initialization".to_string(),
                event_id: "abc123def456".to_string(),
                next_stage: Some("validation".to_string()),
            })
            .expect_err("should reject");
        assert!(matches!(err, FsmError::StageMismatch { .. }));
        // State unchanged
        assert_eq!(
            fsm.state(),
            &FsmState::Running {
                stage: "scaffolding".to_string()
            }
        );
    }

    #[test]
    fn test_last_stage_completes_workflow() {
        let mut fsm = running("deployment");
        let effects = fsm
            .apply(FsmEvent::StageComplete {
                stage: "deployment".to_string(),
                event_id: "abc123def456".to_string(),
                next_stage: None,
            })
            .expect("should complete");
        assert_eq!(effects, vec![FsmEffect::WorkflowCompleted]);
        assert!(fsm.state().is_terminal());
    }

    #[test]
    fn test_stage_failed_with_budget_retries_in_place() {
        let mut fsm = running("validation");
        let effects = fsm
            .apply(FsmEvent::StageFailed {
                stage: "validation".to_string(),
                error: "agent crashed".to_string(),
                retries_exhausted: false,
            })
            .expect("should retry");
        assert_eq!(
            effects,
            vec![FsmEffect::RetryStage {
                stage: "validation".to_string()
            }]
        );
        // No transition until success or exhaustion
        assert_eq!(
            fsm.state(),
            &FsmState::Running {
                stage: "validation".to_string()
            }
        );
    }

    #[test]
    fn test_stage_failed_exhausted_fails_workflow() {
        let mut fsm = running("validation");
        let effects = fsm
            .apply(FsmEvent::StageFailed {
                stage: "validation".to_string(),
                error: "agent crashed".to_string(),
                retries_exhausted: true,
            })
            .expect("should fail");
        assert_eq!(
            effects,
            vec![FsmEffect::WorkflowFailed {
                error: "agent crashed".to_string()
            }]
        );
        assert!(fsm.state().is_terminal());
    }

    #[test]
    fn test_cancel_is_unconditional_for_non_terminal() {
        for mut fsm in [
            WorkflowFsm::new(),
            running("validation"),
            WorkflowFsm::from_state(FsmState::PausedForDecision {
                id: "d1".to_string(),
                stage: "validation".to_string(),
            }),
        ] {
            let effects = fsm.apply(FsmEvent::Cancel).expect("should cancel");
            assert_eq!(effects, vec![FsmEffect::WorkflowCancelled]);
            assert_eq!(fsm.state(), &FsmState::Cancelled);
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        let mut fsm = WorkflowFsm::from_state(FsmState::Completed);
        assert_eq!(fsm.apply(FsmEvent::Cancel), Err(FsmError::TerminalState));
        assert_eq!(fsm.apply(FsmEvent::Retry), Err(FsmError::TerminalState));
    }

    #[test]
    fn test_decision_pause_and_approve_resume() {
        let mut fsm = running("validation");

        let effects = fsm
            .apply(FsmEvent::DecisionRequired {
                id: "d1".to_string(),
            })
            .expect("should pause");
        assert_eq!(effects, vec![FsmEffect::WorkflowPaused]);

        // Pausing again with the same id is a no-op
        let effects = fsm
            .apply(FsmEvent::DecisionRequired {
                id: "d1".to_string(),
            })
            .expect("should be idempotent");
        assert!(effects.is_empty());

        let effects = fsm
            .apply(FsmEvent::DecisionApproved {
                id: "d1".to_string(),
            })
            .expect("should resume");
        assert_eq!(
            effects,
            vec![FsmEffect::WorkflowResumed {
                stage: "validation".to_string()
            }]
        );
    }

    #[test]
    fn test_decision_rejected_fails_workflow() {
        let mut fsm = running("validation");
        fsm.apply(FsmEvent::DecisionRequired {
            id: "d1".to_string(),
        })
        .unwrap();

        let effects = fsm
            .apply(FsmEvent::DecisionRejected {
                id: "d1".to_string(),
                reason: "budget".to_string(),
            })
            .expect("should fail");
        assert!(matches!(effects[0], FsmEffect::WorkflowFailed { .. }));
        assert!(fsm.state().is_terminal());
    }

    #[test]
    fn test_clarification_pause_resume() {
        let mut fsm = running("scaffolding");
        fsm.apply(FsmEvent::ClarificationRequired {
            id: "c1".to_string(),
        })
        .unwrap();

        let effects = fsm
            .apply(FsmEvent::ClarificationComplete {
                id: "c1".to_string(),
            })
            .expect("should resume");
        assert_eq!(
            effects,
            vec![FsmEffect::WorkflowResumed {
                stage: "scaffolding".to_string()
            }]
        );
    }
}
