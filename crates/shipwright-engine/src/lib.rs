//! Workflow execution engine
//!
//! The four tightly coupled parts of the orchestrator core live here:
//!
//! - [`EnvelopeBuilder`] produces stage-specific agent payloads from a
//!   workflow and its prior stage outputs.
//! - [`AgentDispatcher`] publishes envelopes to per-agent-type topics and
//!   owns the single persistent subscriber on the shared result topic.
//! - [`WorkflowFsm`] is the per-workflow state machine; [`FsmRegistry`]
//!   keys live instances by workflow id.
//! - [`WorkflowService`] is the public API (create/cancel/retry) and the
//!   owner of the exactly-once result pipeline.
//!
//! The event aggregator and the DAG pipeline executor round out the crate.

mod aggregator;
mod dispatcher;
mod envelope_builder;
mod error;
mod fsm;
mod pipeline;
mod registry;
mod service;

pub use aggregator::{AggregatorSnapshot, EventAggregator};
pub use dispatcher::{AgentDispatcher, ResultHandler};
pub use envelope_builder::EnvelopeBuilder;
pub use error::EngineError;
pub use fsm::{FsmEffect, FsmError, FsmEvent, FsmRegistry, FsmState, WorkflowFsm};
pub use pipeline::{
    ExecutionMode, GateComparison, PipelineExecutor, PipelineRun, PipelineStage, QualityGate,
    StageRunner, StageRunResult, StageStatus,
};
pub use registry::AgentRegistry;
pub use service::{PipelineCounters, ResultOutcome, WorkflowService};
