//! Persistence port for the orchestrator
//!
//! [`OrchestratorStore`] is the single relational port: workflows with CAS
//! stage advances, tasks, stage outputs, workflow definitions, scheduled
//! jobs, job executions, event handlers, and pipeline executions.
//!
//! `PgStore` is the production implementation (sqlx/Postgres);
//! `InMemoryStore` backs tests with the same semantics, including CAS.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use store::{
    DefinitionRow, ExecutionLog, JobFilter, OrchestratorStore, PipelineExecutionRow, StoreError,
};
