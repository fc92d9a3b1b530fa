//! Event aggregator: in-memory rollups over lifecycle events
//!
//! Subscribes to workflow lifecycle and scheduler execution topics, keeps
//! lightweight rolling counters, and periodically publishes a snapshot to
//! the KV cache for the dashboard to read. Throughput is a time-windowed
//! counter (completions in the last 60 seconds), not a cumulative total.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use shipwright_bus::{KvStore, MessageBus};
use shipwright_core::topics::{
    EXECUTION_FAILED_TOPIC, EXECUTION_SUCCESS_TOPIC, WORKFLOW_EVENTS_TOPIC,
};
use shipwright_core::{WorkflowEventMessage, WorkflowLifecycle};

use crate::error::EngineError;

/// KV key the snapshot is cached under
pub const SNAPSHOT_KEY: &str = "stats:orchestrator:snapshot";

const THROUGHPUT_WINDOW_SECS: i64 = 60;

/// Published rollup snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorSnapshot {
    pub events_by_type: HashMap<String, u64>,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    pub executions_success: u64,
    pub executions_failed: u64,
    /// Workflow completions observed in the last 60 seconds
    pub throughput_per_minute: u64,
    pub generated_at: DateTime<Utc>,
    /// Extra source (pipeline counters), merged verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<serde_json::Value>,
}

#[derive(Default)]
struct Rollups {
    events_by_type: HashMap<String, u64>,
    workflows_completed: u64,
    workflows_failed: u64,
    executions_success: u64,
    executions_failed: u64,
    completions: VecDeque<DateTime<Utc>>,
}

impl Rollups {
    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.completions.front() {
            if (now - *front).num_seconds() > THROUGHPUT_WINDOW_SECS {
                self.completions.pop_front();
            } else {
                break;
            }
        }
    }
}

type ExtraSource = Box<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Lifecycle event aggregator
pub struct EventAggregator {
    bus: Arc<dyn MessageBus>,
    kv: Arc<dyn KvStore>,
    rollups: Arc<Mutex<Rollups>>,
    extra: Mutex<Option<ExtraSource>>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventAggregator {
    pub fn new(bus: Arc<dyn MessageBus>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            bus,
            kv,
            rollups: Arc::new(Mutex::new(Rollups::default())),
            extra: Mutex::new(None),
            drivers: Mutex::new(Vec::new()),
        }
    }

    /// Merge an additional counter source into each snapshot
    pub fn set_extra_source(&self, source: impl Fn() -> serde_json::Value + Send + Sync + 'static) {
        *self.extra.lock() = Some(Box::new(source));
    }

    /// Subscribe to lifecycle topics and start the snapshot loop
    pub async fn start(&self, snapshot_interval: Duration) -> Result<(), EngineError> {
        let mut workflow_sub = self.bus.subscribe(WORKFLOW_EVENTS_TOPIC).await?;
        let rollups = self.rollups.clone();
        let workflow_driver = tokio::spawn(async move {
            while let Some(message) = workflow_sub.next().await {
                match serde_json::from_slice::<WorkflowEventMessage>(&message.payload) {
                    Ok(event) => {
                        let mut state = rollups.lock();
                        let key = event.metadata.stage.as_str().to_string();
                        *state.events_by_type.entry(key).or_default() += 1;
                        match event.metadata.stage {
                            WorkflowLifecycle::Completed => {
                                state.workflows_completed += 1;
                                state.completions.push_back(Utc::now());
                            }
                            WorkflowLifecycle::Failed => state.workflows_failed += 1,
                            _ => {}
                        }
                    }
                    Err(e) => debug!(error = %e, "undecodable workflow event skipped"),
                }
            }
        });

        let mut success_sub = self.bus.subscribe(EXECUTION_SUCCESS_TOPIC).await?;
        let rollups = self.rollups.clone();
        let success_driver = tokio::spawn(async move {
            while let Some(_message) = success_sub.next().await {
                rollups.lock().executions_success += 1;
            }
        });

        let mut failed_sub = self.bus.subscribe(EXECUTION_FAILED_TOPIC).await?;
        let rollups = self.rollups.clone();
        let failed_driver = tokio::spawn(async move {
            while let Some(_message) = failed_sub.next().await {
                rollups.lock().executions_failed += 1;
            }
        });

        let mut drivers = self.drivers.lock();
        drivers.push(workflow_driver);
        drivers.push(success_driver);
        drivers.push(failed_driver);
        drop(drivers);

        self.start_snapshot_loop(snapshot_interval);
        Ok(())
    }

    fn start_snapshot_loop(&self, interval: Duration) {
        let kv = self.kv.clone();
        let rollups = self.rollups.clone();
        // Snapshot publication has no extra source in the background loop;
        // callers that registered one publish through publish_snapshot.
        let driver = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let snapshot = snapshot_of(&rollups, None);
                publish(&kv, &snapshot).await;
            }
        });
        self.drivers.lock().push(driver);
    }

    /// Current rollup state
    pub fn snapshot(&self) -> AggregatorSnapshot {
        let extra = self.extra.lock();
        snapshot_of(&self.rollups, extra.as_ref().map(|f| f()))
    }

    /// Push the current snapshot to the KV cache
    pub async fn publish_snapshot(&self) {
        let snapshot = self.snapshot();
        publish(&self.kv, &snapshot).await;
    }

    pub fn stop(&self) {
        for driver in self.drivers.lock().drain(..) {
            driver.abort();
        }
    }
}

impl Drop for EventAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn snapshot_of(
    rollups: &Arc<Mutex<Rollups>>,
    pipeline: Option<serde_json::Value>,
) -> AggregatorSnapshot {
    let mut state = rollups.lock();
    let now = Utc::now();
    state.prune(now);
    AggregatorSnapshot {
        events_by_type: state.events_by_type.clone(),
        workflows_completed: state.workflows_completed,
        workflows_failed: state.workflows_failed,
        executions_success: state.executions_success,
        executions_failed: state.executions_failed,
        throughput_per_minute: state.completions.len() as u64,
        generated_at: now,
        pipeline,
    }
}

async fn publish(kv: &Arc<dyn KvStore>, snapshot: &AggregatorSnapshot) {
    let json = match serde_json::to_string(snapshot) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "snapshot serialization failed");
            return;
        }
    };
    if let Err(e) = kv.set_ex(SNAPSHOT_KEY, &json, Duration::from_secs(60)).await {
        warn!(error = %e, "snapshot cache publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_bus::{InMemoryBus, InMemoryKv};
    use shipwright_core::{Workflow, WorkflowStatus, WorkflowType};
    use uuid::Uuid;

    fn sample_workflow(status: WorkflowStatus) -> Workflow {
        Workflow {
            id: Uuid::now_v7(),
            workflow_type: WorkflowType::App,
            platform_id: None,
            status,
            current_stage: "deployment".to_string(),
            progress: 100,
            stage_outputs: vec![],
            version: 5,
            name: "My App".to_string(),
            description: None,
            requirements: None,
            created_by: None,
            trace_id: Uuid::new_v4(),
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_rollups_and_windowed_throughput() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let aggregator = EventAggregator::new(bus.clone(), kv.clone());
        aggregator
            .start(Duration::from_secs(3600))
            .await
            .expect("should start");

        let completed = sample_workflow(WorkflowStatus::Completed);
        let message =
            WorkflowEventMessage::new(&completed, WorkflowLifecycle::Completed, None);
        let payload = serde_json::to_vec(&message).unwrap();
        bus.publish(WORKFLOW_EVENTS_TOPIC, "k", &payload).await.unwrap();

        let failed = sample_workflow(WorkflowStatus::Failed);
        let message = WorkflowEventMessage::new(
            &failed,
            WorkflowLifecycle::Failed,
            Some("agent crashed".to_string()),
        );
        bus.publish(
            WORKFLOW_EVENTS_TOPIC,
            "k",
            &serde_json::to_vec(&message).unwrap(),
        )
        .await
        .unwrap();

        bus.publish(EXECUTION_SUCCESS_TOPIC, "k", b"{}").await.unwrap();

        // Let the subscriber tasks drain
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.workflows_completed, 1);
        assert_eq!(snapshot.workflows_failed, 1);
        assert_eq!(snapshot.executions_success, 1);
        assert_eq!(snapshot.throughput_per_minute, 1);
        assert_eq!(
            snapshot.events_by_type["orchestrator:workflow:completed"],
            1
        );

        aggregator.stop();
    }

    #[tokio::test]
    async fn test_snapshot_published_to_cache() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let aggregator = EventAggregator::new(bus, kv.clone());
        aggregator.set_extra_source(|| serde_json::json!({ "results_processed": 7 }));

        aggregator.publish_snapshot().await;

        let cached = kv.get(SNAPSHOT_KEY).await.unwrap().expect("should cache");
        let parsed: AggregatorSnapshot = serde_json::from_str(&cached).unwrap();
        assert_eq!(parsed.pipeline.unwrap()["results_processed"], 7);
    }
}
