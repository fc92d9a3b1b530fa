//! Handler resolution for job fires
//!
//! `function` handlers live in an in-process registry. `agent` and
//! `workflow` handlers cross into the engine crate; the gateways below keep
//! that dependency pointing one way (the binary implements them over the
//! dispatcher and workflow service).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

/// An in-process job handler
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, payload: &serde_json::Value) -> Result<serde_json::Value, String>;
}

/// Dispatches an agent task on behalf of a job or event handler
#[async_trait]
pub trait AgentJobGateway: Send + Sync + 'static {
    async fn dispatch_agent(
        &self,
        agent_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), String>;
}

/// Creates a workflow on behalf of a job or event handler
#[async_trait]
pub trait WorkflowGateway: Send + Sync + 'static {
    async fn submit_workflow(&self, request: &serde_json::Value) -> Result<Uuid, String>;
}

/// Named function handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.write().insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, payload: &serde_json::Value) -> Result<serde_json::Value, String> {
            Ok(payload.clone())
        }
    }

    #[tokio::test]
    async fn test_register_and_run() {
        let registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Echo));

        let handler = registry.get("echo").expect("should resolve");
        let out = handler
            .run(&serde_json::json!({ "x": 1 }))
            .await
            .expect("should run");
        assert_eq!(out["x"], 1);

        assert!(registry.get("missing").is_none());
    }
}
