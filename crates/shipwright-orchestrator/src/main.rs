// Shipwright orchestrator process
// Decision: the scheduler tick runs in-process next to the result subscriber;
//           horizontal scale comes from running more orchestrator processes
//           against the same bus group

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use shipwright_bus::{MessageBus, RedisBus, RedisKv};
use shipwright_core::{topics, CreateWorkflow, OrchestratorConfig};
use shipwright_definitions::DefinitionEngine;
use shipwright_engine::{
    AgentDispatcher, AgentRegistry, EnvelopeBuilder, EventAggregator, WorkflowService,
};
use shipwright_scheduler::{
    AgentJobGateway, EventEngine, HandlerRegistry, JobExecutor, JobScheduler, WorkflowGateway,
};
use shipwright_storage::PgStore;

/// Scheduled agent jobs publish straight onto the agent pool topics
struct BusAgentGateway {
    bus: Arc<dyn MessageBus>,
}

#[async_trait]
impl AgentJobGateway for BusAgentGateway {
    async fn dispatch_agent(
        &self,
        agent_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), String> {
        let agent_type: shipwright_core::AgentType =
            agent_type.parse().map_err(|e| format!("{e}"))?;
        let bytes = payload.to_string().into_bytes();
        self.bus
            .publish_durable(
                &topics::agent_tasks_topic(agent_type),
                &topics::agent_tasks_stream(agent_type),
                "scheduler",
                &bytes,
            )
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Scheduled workflow jobs go through the workflow service
struct ServiceWorkflowGateway {
    service: Arc<WorkflowService>,
}

#[async_trait]
impl WorkflowGateway for ServiceWorkflowGateway {
    async fn submit_workflow(&self, request: &serde_json::Value) -> Result<Uuid, String> {
        let request: CreateWorkflow =
            serde_json::from_value(request.clone()).map_err(|e| e.to_string())?;
        self.service
            .create_workflow(request)
            .await
            .map(|w| w.id)
            .map_err(|e| e.to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shipwright=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = OrchestratorConfig::from_env();
    tracing::info!(worker_id = %config.worker_id, "shipwright orchestrator starting");

    // Ports
    let store = Arc::new(
        PgStore::from_url(&config.database_url)
            .await
            .context("database connection failed")?,
    );
    tracing::info!("database connected, migrations applied");

    let bus: Arc<dyn MessageBus> = Arc::new(
        RedisBus::connect(&config.redis_url)
            .await
            .context("redis bus connection failed")?,
    );
    let kv = Arc::new(
        RedisKv::connect(&config.redis_url)
            .await
            .context("redis kv connection failed")?,
    );
    tracing::info!("redis connected");

    // Engine
    let definitions = Arc::new(DefinitionEngine::new(store.clone()));
    let registry = AgentRegistry::new(kv.clone());
    let dispatcher = Arc::new(AgentDispatcher::new(bus.clone(), registry));
    let builder = EnvelopeBuilder::new(
        std::env::var("WORKFLOW_OUTPUT_ROOT").unwrap_or_else(|_| "/workspace/out".to_string()),
    );

    let service = WorkflowService::new(
        store.clone(),
        kv.clone(),
        bus.clone(),
        definitions,
        dispatcher.clone(),
        builder,
        config.clone(),
    );
    service.start().await.context("result subscriber failed")?;
    tracing::info!("workflow service ready");

    // Aggregator
    let aggregator = Arc::new(EventAggregator::new(bus.clone(), kv.clone()));
    {
        let service = service.clone();
        aggregator.set_extra_source(move || service.counters().snapshot());
    }
    aggregator
        .start(std::time::Duration::from_secs(15))
        .await
        .context("aggregator start failed")?;

    // Scheduler
    let handlers = Arc::new(HandlerRegistry::new());
    let scheduler = Arc::new(JobScheduler::new(store.clone(), bus.clone()));
    let executor = Arc::new(
        JobExecutor::new(store.clone(), bus.clone(), handlers.clone())
            .with_agent_gateway(Arc::new(BusAgentGateway { bus: bus.clone() }))
            .with_workflow_gateway(Arc::new(ServiceWorkflowGateway {
                service: service.clone(),
            })),
    );

    let events = Arc::new(
        EventEngine::new(
            store.clone(),
            bus.clone(),
            handlers.clone(),
            scheduler.clone(),
            config.event_subscribe_timeout,
        )
        .with_gateways(
            Some(Arc::new(BusAgentGateway { bus: bus.clone() })),
            Some(Arc::new(ServiceWorkflowGateway {
                service: service.clone(),
            })),
        ),
    );
    let bound = events.reload().await.context("event handler reload failed")?;
    tracing::info!(handlers = bound, "event subscriptions bound");

    // Tick loop
    let tick_scheduler = scheduler.clone();
    let tick_executor = executor.clone();
    let tick = tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.scheduler_tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let now = chrono::Utc::now();
            match tick_scheduler.tick(now).await {
                Ok((fires, retries)) => {
                    for job in fires {
                        let executor = tick_executor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = executor.execute_job(&job).await {
                                tracing::error!(job_id = %job.id, error = %e, "job execution errored");
                            }
                        });
                    }
                    for execution in retries {
                        let executor = tick_executor.clone();
                        tokio::spawn(async move {
                            let execution_id = execution.id;
                            if let Err(e) = executor.execute_retry(execution).await {
                                tracing::error!(execution_id = %execution_id, error = %e, "retry execution errored");
                            }
                        });
                    }
                }
                Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
            }
        }
    });

    tracing::info!("orchestrator ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received; draining");

    tick.abort();
    events.shutdown();
    aggregator.stop();
    dispatcher.disconnect().await;

    Ok(())
}
