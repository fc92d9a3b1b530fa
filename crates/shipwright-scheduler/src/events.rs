//! Event-triggered jobs
//!
//! `on_event` persists a handler row; `trigger_event` publishes to the bus.
//! Subscriptions are lazy and timeout-bounded: a bus that is briefly
//! unavailable does not fail handler registration, and `reload` re-binds
//! every persisted event after a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use shipwright_bus::MessageBus;
use shipwright_core::{ActionType, EventHandler, HandlerStats, HandlerType};
use shipwright_storage::OrchestratorStore;

use crate::error::SchedulerError;
use crate::handlers::{AgentJobGateway, HandlerRegistry, WorkflowGateway};
use crate::scheduler::{JobScheduler, JobSpec};

/// Topic an application event is published on
pub fn event_topic(event_name: &str) -> String {
    format!("events:{event_name}")
}

/// Performs a handler's configured action when its event fires
struct ActionRunner {
    store: Arc<dyn OrchestratorStore>,
    registry: Arc<HandlerRegistry>,
    scheduler: Arc<JobScheduler>,
    agent_gateway: Option<Arc<dyn AgentJobGateway>>,
    workflow_gateway: Option<Arc<dyn WorkflowGateway>>,
}

impl ActionRunner {
    async fn fire(&self, event_name: &str, data: &serde_json::Value) {
        let handlers = match self.store.list_event_handlers(Some(event_name)).await {
            Ok(handlers) => handlers,
            Err(e) => {
                warn!(event_name, error = %e, "handler lookup failed");
                return;
            }
        };

        for handler in handlers {
            let ok = self.perform(&handler, data).await;
            let mut stats = handler.stats;
            stats.triggered_count += 1;
            if ok {
                stats.success_count += 1;
            } else {
                stats.failure_count += 1;
            }
            // Stats must never fail the event
            if let Err(e) = self.store.update_handler_stats(handler.id, &stats).await {
                warn!(handler_id = %handler.id, error = %e, "handler stats update failed");
            }
        }
    }

    async fn perform(&self, handler: &EventHandler, data: &serde_json::Value) -> bool {
        let result = match handler.action_type {
            ActionType::Function => self.run_function(handler, data).await,
            ActionType::CreateJob => self.create_job(handler).await,
            ActionType::DispatchAgent => self.dispatch_agent(handler, data).await,
            ActionType::TriggerWorkflow => self.trigger_workflow(handler, data).await,
        };

        if let Err(e) = &result {
            warn!(
                event_name = %handler.event_name,
                handler = %handler.handler_name,
                error = %e,
                "event handler action failed"
            );
        }
        result.is_ok()
    }

    async fn run_function(
        &self,
        handler: &EventHandler,
        data: &serde_json::Value,
    ) -> Result<(), String> {
        let function = self
            .registry
            .get(&handler.handler_name)
            .ok_or_else(|| format!("no handler registered under {:?}", handler.handler_name))?;
        function.run(data).await.map(|_| ())
    }

    async fn create_job(&self, handler: &EventHandler) -> Result<(), String> {
        let config = &handler.action_config;
        let cron = config
            .get("cron")
            .and_then(|v| v.as_str())
            .ok_or("action_config missing cron")?;
        let name = config
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(&handler.handler_name);
        let job_handler = config
            .get("handler_name")
            .and_then(|v| v.as_str())
            .unwrap_or(&handler.handler_name);

        let spec = JobSpec::new(name, job_handler, HandlerType::Function)
            .with_payload(config.get("payload").cloned().unwrap_or(json!({})));
        self.scheduler
            .schedule(spec, cron)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn dispatch_agent(
        &self,
        handler: &EventHandler,
        data: &serde_json::Value,
    ) -> Result<(), String> {
        let gateway = self
            .agent_gateway
            .as_ref()
            .ok_or("no agent gateway configured")?;
        let agent_type = handler
            .action_config
            .get("agent_type")
            .and_then(|v| v.as_str())
            .ok_or("action_config missing agent_type")?;
        gateway.dispatch_agent(agent_type, data).await
    }

    async fn trigger_workflow(
        &self,
        handler: &EventHandler,
        data: &serde_json::Value,
    ) -> Result<(), String> {
        let gateway = self
            .workflow_gateway
            .as_ref()
            .ok_or("no workflow gateway configured")?;
        let mut request = handler.action_config.clone();
        if let Some(map) = request.as_object_mut() {
            map.insert("event_data".to_string(), data.clone());
        }
        gateway.submit_workflow(&request).await.map(|_| ())
    }
}

/// Persisted event handlers bound to lazy bus subscriptions
pub struct EventEngine {
    store: Arc<dyn OrchestratorStore>,
    bus: Arc<dyn MessageBus>,
    runner: Arc<ActionRunner>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
    subscribe_timeout: Duration,
}

impl EventEngine {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        bus: Arc<dyn MessageBus>,
        registry: Arc<HandlerRegistry>,
        scheduler: Arc<JobScheduler>,
        subscribe_timeout: Duration,
    ) -> Self {
        Self {
            runner: Arc::new(ActionRunner {
                store: store.clone(),
                registry,
                scheduler,
                agent_gateway: None,
                workflow_gateway: None,
            }),
            store,
            bus,
            subscriptions: Mutex::new(HashMap::new()),
            subscribe_timeout,
        }
    }

    pub fn with_gateways(
        mut self,
        agent: Option<Arc<dyn AgentJobGateway>>,
        workflow: Option<Arc<dyn WorkflowGateway>>,
    ) -> Self {
        let runner = Arc::new(ActionRunner {
            store: self.runner.store.clone(),
            registry: self.runner.registry.clone(),
            scheduler: self.runner.scheduler.clone(),
            agent_gateway: agent,
            workflow_gateway: workflow,
        });
        self.runner = runner;
        self
    }

    /// Persist a handler and lazily bind its event's subscription
    pub async fn on_event(
        &self,
        event_name: &str,
        handler_name: &str,
        action_type: ActionType,
        action_config: serde_json::Value,
        priority: i32,
        platform_id: Option<Uuid>,
    ) -> Result<EventHandler, SchedulerError> {
        let handler = EventHandler {
            id: Uuid::now_v7(),
            event_name: event_name.to_string(),
            handler_name: handler_name.to_string(),
            enabled: true,
            priority,
            action_type,
            action_config,
            platform_id,
            stats: HandlerStats::default(),
        };
        self.store.upsert_event_handler(&handler).await?;
        self.ensure_subscription(event_name).await;
        info!(event_name, handler_name, "event handler registered");
        Ok(handler)
    }

    /// Publish an application event
    pub async fn trigger_event(
        &self,
        event_name: &str,
        data: serde_json::Value,
    ) -> Result<(), SchedulerError> {
        let payload = serde_json::to_vec(&data)?;
        self.bus
            .publish(&event_topic(event_name), event_name, &payload)
            .await?;
        Ok(())
    }

    /// Re-bind subscriptions for every persisted handler (startup, bus
    /// reconnect)
    pub async fn reload(&self) -> Result<usize, SchedulerError> {
        let handlers = self.store.list_event_handlers(None).await?;
        let mut names: Vec<String> = handlers.into_iter().map(|h| h.event_name).collect();
        names.sort();
        names.dedup();
        let count = names.len();
        for name in names {
            self.ensure_subscription(&name).await;
        }
        Ok(count)
    }

    /// Subscribe to one event topic, tolerating transient bus unavailability
    async fn ensure_subscription(&self, event_name: &str) {
        if self.subscriptions.lock().contains_key(event_name) {
            return;
        }

        let subscribed = tokio::time::timeout(
            self.subscribe_timeout,
            self.bus.subscribe(&event_topic(event_name)),
        )
        .await;

        let mut subscription = match subscribed {
            Ok(Ok(subscription)) => subscription,
            Ok(Err(e)) => {
                warn!(event_name, error = %e, "event subscription failed; reload will re-bind");
                return;
            }
            Err(_) => {
                warn!(event_name, "event subscription timed out; reload will re-bind");
                return;
            }
        };

        let runner = self.runner.clone();
        let name = event_name.to_string();
        let driver = tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let data: serde_json::Value =
                    serde_json::from_slice(&message.payload).unwrap_or(serde_json::Value::Null);
                runner.fire(&name, &data).await;
            }
        });

        self.subscriptions
            .lock()
            .insert(event_name.to_string(), driver);
    }

    pub fn shutdown(&self) {
        for (_, driver) in self.subscriptions.lock().drain() {
            driver.abort();
        }
    }
}

impl Drop for EventEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shipwright_bus::InMemoryBus;
    use shipwright_storage::InMemoryStore;

    use crate::handlers::JobHandler;

    struct Recorder(tokio::sync::mpsc::Sender<serde_json::Value>);

    #[async_trait]
    impl JobHandler for Recorder {
        async fn run(&self, payload: &serde_json::Value) -> Result<serde_json::Value, String> {
            self.0.send(payload.clone()).await.map_err(|e| e.to_string())?;
            Ok(serde_json::Value::Null)
        }
    }

    fn engine() -> (
        EventEngine,
        Arc<InMemoryStore>,
        Arc<HandlerRegistry>,
        Arc<JobScheduler>,
    ) {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(HandlerRegistry::new());
        let scheduler = Arc::new(JobScheduler::new(store.clone(), bus.clone()));
        let engine = EventEngine::new(
            store.clone(),
            bus,
            registry.clone(),
            scheduler.clone(),
            Duration::from_secs(3),
        );
        (engine, store, registry, scheduler)
    }

    #[tokio::test]
    async fn test_trigger_invokes_function_handler() {
        let (engine, _, registry, _) = engine();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        registry.register("record", Arc::new(Recorder(tx)));

        engine
            .on_event(
                "deploy.requested",
                "record",
                ActionType::Function,
                json!({}),
                0,
                None,
            )
            .await
            .expect("should register");

        engine
            .trigger_event("deploy.requested", json!({ "env": "staging" }))
            .await
            .expect("should trigger");

        let data = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("handler should fire")
            .expect("channel open");
        assert_eq!(data["env"], "staging");
    }

    #[tokio::test]
    async fn test_create_job_action_schedules_a_job() {
        let (engine, store, _, _) = engine();

        engine
            .on_event(
                "nightly.sync",
                "sync",
                ActionType::CreateJob,
                json!({ "cron": "0 2 * * *", "name": "sync-job", "handler_name": "sync" }),
                0,
                None,
            )
            .await
            .expect("should register");

        engine
            .trigger_event("nightly.sync", json!({}))
            .await
            .expect("should trigger");

        // Let the subscription task run the action
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let jobs = store
                .list_jobs(&shipwright_storage::JobFilter::default())
                .await
                .unwrap();
            if !jobs.is_empty() {
                assert_eq!(jobs[0].name, "sync-job");
                return;
            }
        }
        panic!("create_job action did not run");
    }

    #[tokio::test]
    async fn test_handler_stats_are_updated() {
        let (engine, store, registry, _) = engine();
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        registry.register("record", Arc::new(Recorder(tx)));

        let handler = engine
            .on_event("ping", "record", ActionType::Function, json!({}), 0, None)
            .await
            .unwrap();

        engine.trigger_event("ping", json!({})).await.unwrap();

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let handlers = store.list_event_handlers(Some("ping")).await.unwrap();
            if handlers[0].stats.triggered_count == 1 {
                assert_eq!(handlers[0].id, handler.id);
                return;
            }
        }
        panic!("handler stats never updated");
    }

    #[tokio::test]
    async fn test_reload_rebinds_persisted_handlers() {
        let (engine, store, registry, scheduler) = engine();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        registry.register("record", Arc::new(Recorder(tx)));

        // Handler persisted by a previous process
        store
            .upsert_event_handler(&EventHandler {
                id: Uuid::now_v7(),
                event_name: "restored.event".to_string(),
                handler_name: "record".to_string(),
                enabled: true,
                priority: 0,
                action_type: ActionType::Function,
                action_config: json!({}),
                platform_id: None,
                stats: HandlerStats::default(),
            })
            .await
            .unwrap();
        let _ = scheduler;

        let bound = engine.reload().await.expect("should reload");
        assert_eq!(bound, 1);

        engine
            .trigger_event("restored.event", json!({ "ok": true }))
            .await
            .unwrap();
        let data = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("handler should fire")
            .expect("channel open");
        assert_eq!(data["ok"], true);
    }
}
