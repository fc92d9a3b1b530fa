//! Agent dispatch and the persistent result subscriber
//!
//! Envelopes go out on `agent:{agent_type}:tasks` keyed by workflow id and
//! mirrored to the durable stream for replay. Results come back on the
//! shared `orchestrator:results` topic through a single consumer-group
//! subscriber; every message is handed verbatim to the one handler the
//! service registers at init. There is no per-workflow handler table.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use shipwright_bus::MessageBus;
use shipwright_core::topics::{RESULTS_GROUP, RESULTS_TOPIC};
use shipwright_core::{topics, AgentEnvelope};

use crate::error::EngineError;
use crate::registry::AgentRegistry;

/// Stream mirror of the shared result topic
fn results_stream() -> String {
    format!("stream:{RESULTS_TOPIC}")
}

/// Receives raw result payloads from the bus
///
/// The implementation must never panic the subscription: handler errors are
/// logged by the loop and the next message is processed.
#[async_trait]
pub trait ResultHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &[u8]);
}

/// Publishes task envelopes and owns the result subscription
pub struct AgentDispatcher {
    bus: Arc<dyn MessageBus>,
    registry: AgentRegistry,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl AgentDispatcher {
    pub fn new(bus: Arc<dyn MessageBus>, registry: AgentRegistry) -> Self {
        Self {
            bus,
            registry,
            subscriber: Mutex::new(None),
        }
    }

    /// Publish an envelope to its agent pool
    ///
    /// Publish failure is fatal for the caller; zero live subscribers is a
    /// warning only - the stream mirror holds the task until an agent
    /// attaches.
    pub async fn dispatch(&self, envelope: &AgentEnvelope) -> Result<(), EngineError> {
        let topic = topics::agent_tasks_topic(envelope.agent_type);
        let stream = topics::agent_tasks_stream(envelope.agent_type);
        let payload = envelope.to_bytes()?;
        let routing_key = envelope.workflow_id.to_string();

        let received = self
            .bus
            .publish_durable(&topic, &stream, &routing_key, &payload)
            .await
            .map_err(|e| EngineError::DispatchFailed(e.to_string()))?;

        if received == 0 {
            let registered = self
                .registry
                .count_for_type(envelope.agent_type)
                .await
                .unwrap_or(0);
            warn!(
                %topic,
                workflow_id = %envelope.workflow_id,
                task_id = %envelope.task_id,
                registered_agents = registered,
                "dispatch reached no live subscribers"
            );
        }

        Ok(())
    }

    /// Start the single persistent result subscriber
    ///
    /// Registered once at service init; a second call replaces the previous
    /// loop. Handler failures must not kill the subscription, so the loop
    /// only logs and continues.
    pub async fn start_result_subscriber(
        &self,
        handler: Arc<dyn ResultHandler>,
    ) -> Result<(), EngineError> {
        let mut subscription = self
            .bus
            .subscribe_group(&results_stream(), RESULTS_GROUP)
            .await?;

        let driver = tokio::spawn(async move {
            info!(topic = RESULTS_TOPIC, group = RESULTS_GROUP, "result subscriber started");
            while let Some(message) = subscription.next().await {
                handler.handle(&message.payload).await;
            }
            error!(topic = RESULTS_TOPIC, "result subscription ended");
        });

        if let Some(previous) = self.subscriber.lock().replace(driver) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop the subscriber and drop the publisher
    pub async fn disconnect(&self) {
        if let Some(driver) = self.subscriber.lock().take() {
            driver.abort();
        }
        info!("dispatcher disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shipwright_bus::{InMemoryBus, InMemoryKv};
    use shipwright_core::{
        AgentPayload, AgentType, TaskPriority, TaskStatus, WorkflowContext, WorkflowType,
        ENVELOPE_VERSION,
    };
    use uuid::Uuid;

    fn sample_envelope() -> AgentEnvelope {
        AgentEnvelope {
            id: Uuid::now_v7(),
            message_type: "task".to_string(),
            workflow_id: Uuid::now_v7(),
            task_id: Uuid::now_v7(),
            stage: "scaffolding".to_string(),
            agent_type: AgentType::Scaffold,
            priority: TaskPriority::Medium,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            timeout_ms: 60_000,
            created_at: Utc::now(),
            trace_id: Uuid::new_v4(),
            envelope_version: ENVELOPE_VERSION.to_string(),
            workflow_context: WorkflowContext {
                workflow_type: WorkflowType::App,
                workflow_name: "My App".to_string(),
                current_stage: "scaffolding".to_string(),
                stage_outputs: serde_json::Map::new(),
            },
            payload: AgentPayload::Scaffold {
                action: "scaffold".to_string(),
                app_name: "My App".to_string(),
                requirements: serde_json::Value::Null,
                output_dir: "/out".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_dispatch_publishes_and_mirrors() {
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = AgentDispatcher::new(
            bus.clone(),
            AgentRegistry::new(Arc::new(InMemoryKv::new())),
        );

        let mut sub = bus.subscribe("agent:scaffold:tasks").await.unwrap();

        let envelope = sample_envelope();
        dispatcher.dispatch(&envelope).await.expect("should dispatch");

        let message = sub.next().await.expect("should receive");
        let parsed = AgentEnvelope::from_bytes(&message.payload).expect("should parse");
        assert_eq!(parsed.task_id, envelope.task_id);

        assert_eq!(bus.stream_len("stream:agent:scaffold:tasks"), 1);
    }

    #[tokio::test]
    async fn test_result_subscriber_hands_payload_to_handler() {
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = AgentDispatcher::new(
            bus.clone(),
            AgentRegistry::new(Arc::new(InMemoryKv::new())),
        );

        struct Capture(tokio::sync::mpsc::Sender<Vec<u8>>);

        #[async_trait]
        impl ResultHandler for Capture {
            async fn handle(&self, payload: &[u8]) {
                let _ = self.0.send(payload.to_vec()).await;
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        dispatcher
            .start_result_subscriber(Arc::new(Capture(tx)))
            .await
            .expect("should subscribe");

        bus.publish_durable(
            RESULTS_TOPIC,
            &results_stream(),
            "wf-1",
            b"result-bytes",
        )
        .await
        .unwrap();

        let received = rx.recv().await.expect("handler should run");
        assert_eq!(received, b"result-bytes");

        dispatcher.disconnect().await;
    }
}
