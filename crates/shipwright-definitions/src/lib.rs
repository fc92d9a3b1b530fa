//! Workflow definition engine
//!
//! Loads platform-scoped stage definitions (ordered, weighted) and answers
//! the three questions the execution engine asks: what is the next stage,
//! how far along is this workflow, and which agent handles a stage.
//!
//! Definitions come from the store, cached per (platform, workflow_type).
//! When no stored definition exists the engine falls back to a built-in
//! legacy table - data, not control flow, so a new workflow type ships by
//! adding a row.

mod definition;
mod engine;
mod legacy;
mod progress;

pub use definition::{
    ProgressCalculation, StageCondition, StageDefinition, ValidationReport, WorkflowDefinition,
};
pub use engine::{DefinitionEngine, NextStage, StageProgress};
pub use legacy::legacy_definitions;
