//! Bus topic, stream, and KV key names
//!
//! These names are wire contracts shared with agents and the dashboard;
//! they must not drift.

use uuid::Uuid;

use crate::task::AgentType;

/// Shared result topic all agents publish completions to
pub const RESULTS_TOPIC: &str = "orchestrator:results";

/// Durable consumer group for the orchestrator's single result subscriber
pub const RESULTS_GROUP: &str = "orchestrator-core";

/// Workflow lifecycle event topic
pub const WORKFLOW_EVENTS_TOPIC: &str = "workflow:events";

/// Hash of registered agent descriptors
pub const AGENTS_REGISTRY_KEY: &str = "agents:registry";

// Scheduler lifecycle topics
pub const JOB_CREATED_TOPIC: &str = "scheduler:job.created";
pub const JOB_UPDATED_TOPIC: &str = "scheduler:job.updated";
pub const JOB_DELETED_TOPIC: &str = "scheduler:job.deleted";
pub const JOB_PAUSED_TOPIC: &str = "scheduler:job.paused";
pub const JOB_RESUMED_TOPIC: &str = "scheduler:job.resumed";
pub const JOB_CANCELLED_TOPIC: &str = "scheduler:job.cancelled";
pub const JOB_DISPATCH_TOPIC: &str = "scheduler:job.dispatch";
pub const JOB_DISPATCH_STREAM: &str = "stream:scheduler:job.dispatch";
pub const EXECUTION_SUCCESS_TOPIC: &str = "scheduler:execution.success";
pub const EXECUTION_FAILED_TOPIC: &str = "scheduler:execution.failed";
pub const EXECUTION_RETRY_TOPIC: &str = "scheduler:execution.retry_scheduled";
pub const JOB_RESULTS_STREAM: &str = "stream:scheduler:job.results";

/// Task topic for one agent pool
pub fn agent_tasks_topic(agent_type: AgentType) -> String {
    format!("agent:{agent_type}:tasks")
}

/// Durable stream mirror for one agent pool's task topic
pub fn agent_tasks_stream(agent_type: AgentType) -> String {
    format!("stream:agent:{agent_type}:tasks")
}

/// Dedup set of event ids already applied for a task (48 h TTL)
pub fn seen_set_key(task_id: Uuid) -> String {
    format!("seen:{task_id}")
}

/// Per-task distributed lock key (PX TTL string holding the lock token)
pub fn task_lock_key(task_id: Uuid) -> String {
    format!("lock:task:{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_topic_names() {
        assert_eq!(agent_tasks_topic(AgentType::Scaffold), "agent:scaffold:tasks");
        assert_eq!(
            agent_tasks_stream(AgentType::Deployment),
            "stream:agent:deployment:tasks"
        );
    }

    #[test]
    fn test_kv_key_names() {
        let id = Uuid::parse_str("0190b5a8-4c2e-7000-8000-000000000001").unwrap();
        assert_eq!(
            seen_set_key(id),
            "seen:0190b5a8-4c2e-7000-8000-000000000001"
        );
        assert_eq!(
            task_lock_key(id),
            "lock:task:0190b5a8-4c2e-7000-8000-000000000001"
        );
    }
}
