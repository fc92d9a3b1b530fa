//! Agent registry over the KV port
//!
//! `agents:registry` is a hash of agent_id -> JSON descriptor. Agents
//! register and heartbeat through their own processes; the orchestrator
//! reads it to answer "is anyone listening for this agent type".

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use shipwright_bus::{KvError, KvStore};
use shipwright_core::topics::AGENTS_REGISTRY_KEY;
use shipwright_core::{AgentDescriptor, AgentType};

/// Read/write access to the shared agent registry hash
#[derive(Clone)]
pub struct AgentRegistry {
    kv: Arc<dyn KvStore>,
}

impl AgentRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn register(&self, descriptor: &AgentDescriptor) -> Result<(), KvError> {
        let json = serde_json::to_string(descriptor)?;
        self.kv
            .hset(AGENTS_REGISTRY_KEY, &descriptor.agent_id, &json)
            .await
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<(), KvError> {
        let Some(json) = self.kv.hget(AGENTS_REGISTRY_KEY, agent_id).await? else {
            return Ok(());
        };
        let mut descriptor: AgentDescriptor = serde_json::from_str(&json)?;
        descriptor.last_heartbeat = Utc::now();
        self.kv
            .hset(AGENTS_REGISTRY_KEY, agent_id, &serde_json::to_string(&descriptor)?)
            .await
    }

    pub async fn deregister(&self, agent_id: &str) -> Result<(), KvError> {
        self.kv.hdel(AGENTS_REGISTRY_KEY, agent_id).await
    }

    /// All registered descriptors; undecodable entries are skipped with a log
    pub async fn list(&self) -> Result<Vec<AgentDescriptor>, KvError> {
        let entries = self.kv.hgetall(AGENTS_REGISTRY_KEY).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(agent_id, json)| match serde_json::from_str(&json) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    warn!(%agent_id, error = %e, "undecodable registry entry");
                    None
                }
            })
            .collect())
    }

    /// Count of registered agents for one pool
    pub async fn count_for_type(&self, agent_type: AgentType) -> Result<usize, KvError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|d| d.agent_type == agent_type)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_bus::InMemoryKv;

    fn descriptor(agent_id: &str, agent_type: AgentType) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: agent_id.to_string(),
            agent_type,
            status: "idle".to_string(),
            capabilities: vec![],
            last_heartbeat: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_list_deregister() {
        let registry = AgentRegistry::new(Arc::new(InMemoryKv::new()));

        registry
            .register(&descriptor("scaffold-1", AgentType::Scaffold))
            .await
            .unwrap();
        registry
            .register(&descriptor("validation-1", AgentType::Validation))
            .await
            .unwrap();

        assert_eq!(registry.list().await.unwrap().len(), 2);
        assert_eq!(registry.count_for_type(AgentType::Scaffold).await.unwrap(), 1);
        assert_eq!(registry.count_for_type(AgentType::E2e).await.unwrap(), 0);

        registry.deregister("scaffold-1").await.unwrap();
        assert_eq!(registry.count_for_type(AgentType::Scaffold).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_timestamp() {
        let registry = AgentRegistry::new(Arc::new(InMemoryKv::new()));
        let mut d = descriptor("scaffold-1", AgentType::Scaffold);
        d.last_heartbeat = Utc::now() - chrono::Duration::hours(1);
        registry.register(&d).await.unwrap();

        registry.heartbeat("scaffold-1").await.unwrap();

        let listed = registry.list().await.unwrap();
        assert!(listed[0].last_heartbeat > d.last_heartbeat);
    }
}
