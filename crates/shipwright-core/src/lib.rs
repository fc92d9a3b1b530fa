//! Core domain model for the Shipwright orchestrator
//!
//! This crate defines the entities the rest of the workspace agrees on:
//! workflows and their tasks, the versioned agent wire contract, scheduled
//! jobs and their executions, bus topic names, and the collision-proof
//! event-id used by the exactly-once result pipeline.
//!
//! It deliberately has no I/O dependencies. Ports (bus, KV, store) consume
//! these types; they never define their own copies.

pub mod config;
pub mod envelope;
pub mod error;
pub mod event_id;
pub mod events;
pub mod job;
pub mod result;
pub mod task;
pub mod topics;
pub mod workflow;

pub use config::OrchestratorConfig;
pub use envelope::{AgentEnvelope, AgentPayload, WorkflowContext, ENVELOPE_VERSION};
pub use error::{SchemaError, ValidationError};
pub use event_id::event_id;
pub use events::{WorkflowEventMessage, WorkflowLifecycle};
pub use job::{
    ActionType, EventHandler, ExecutionStatus, HandlerStats, HandlerType, JobExecution, JobStats,
    JobStatus, JobType, ScheduledJob,
};
pub use result::{AgentResult, ResultEnvelope};
pub use task::{AgentType, Task, TaskPriority, TaskStatus};
pub use workflow::{
    AgentDescriptor, CreateWorkflow, StageOutput, Workflow, WorkflowStatus, WorkflowType,
};
