//! DAG pipeline executor with quality gates
//!
//! Builds a dependency graph from each stage's `dependencies` list and runs
//! it sequentially or in dependency-respecting parallel waves. Every stage
//! evaluates its quality gates against the metrics it reported; a failing
//! blocking gate aborts the run. Cancellation of concurrent stages is
//! cooperative and timeout-bounded: no new stages start, in-flight ones are
//! awaited up to their own timeout. Pause/resume round-trips through the
//! store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use shipwright_core::ValidationError;
use shipwright_storage::{OrchestratorStore, PipelineExecutionRow};

use crate::error::EngineError;

/// How stages with satisfied dependencies are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// Threshold comparison for a quality gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateComparison {
    Gte,
    Lte,
    Gt,
    Lt,
}

impl GateComparison {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gte => value >= threshold,
            Self::Lte => value <= threshold,
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
        }
    }
}

/// Threshold check on a metric a stage reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub metric: String,
    pub comparison: GateComparison,
    pub threshold: f64,
    /// Blocking gates abort the run on failure; advisory ones only log
    pub blocking: bool,
}

/// One node of the pipeline DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub gates: Vec<QualityGate>,
    pub timeout_ms: u64,
}

/// Terminal state of one stage within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Completed,
    Failed,
    /// Not started because the run aborted first
    Cancelled,
}

/// What a stage handler returns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRunResult {
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    #[serde(default)]
    pub output: serde_json::Value,
}

/// Executes one stage of a pipeline run
#[async_trait]
pub trait StageRunner: Send + Sync + 'static {
    async fn run(&self, stage: &PipelineStage) -> Result<StageRunResult, String>;
}

/// Persisted state of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub name: String,
    pub mode: ExecutionMode,
    pub status: String,
    pub stages: Vec<PipelineStage>,
    pub stage_states: HashMap<String, StageStatus>,
    #[serde(default)]
    pub gate_failures: Vec<String>,
}

impl PipelineRun {
    fn completed_set(&self) -> HashSet<String> {
        self.stage_states
            .iter()
            .filter(|(_, s)| **s == StageStatus::Completed)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn is_settled(&self, stage: &str) -> bool {
        !matches!(
            self.stage_states.get(stage),
            Some(StageStatus::Pending) | None
        )
    }
}

/// Runs pipeline DAGs against a stage runner
pub struct PipelineExecutor {
    store: Arc<dyn OrchestratorStore>,
    runner: Arc<dyn StageRunner>,
    paused: DashMap<Uuid, ()>,
}

impl PipelineExecutor {
    pub fn new(store: Arc<dyn OrchestratorStore>, runner: Arc<dyn StageRunner>) -> Self {
        Self {
            store,
            runner,
            paused: DashMap::new(),
        }
    }

    /// Reject graphs with unknown dependencies or cycles
    pub fn validate(stages: &[PipelineStage]) -> Result<(), EngineError> {
        if stages.is_empty() {
            return Err(ValidationError::Invalid("pipeline has no stages".into()).into());
        }

        let names: HashSet<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        if names.len() != stages.len() {
            return Err(ValidationError::Invalid("duplicate stage names".into()).into());
        }
        for stage in stages {
            for dep in &stage.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(ValidationError::Invalid(format!(
                        "stage {:?} depends on unknown stage {dep:?}",
                        stage.name
                    ))
                    .into());
                }
            }
        }

        // Kahn's algorithm; leftovers mean a cycle
        let mut resolved: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&PipelineStage> = stages.iter().collect();
        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.dependencies.iter().all(|d| resolved.contains(d.as_str()))
                })
                .map(|(i, _)| i)
                .collect();
            if ready.is_empty() {
                return Err(ValidationError::Invalid("dependency cycle".into()).into());
            }
            for index in ready.into_iter().rev() {
                resolved.insert(remaining.remove(index).name.as_str());
            }
        }
        Ok(())
    }

    /// Start a new run
    pub async fn execute(
        &self,
        name: &str,
        stages: Vec<PipelineStage>,
        mode: ExecutionMode,
    ) -> Result<PipelineRun, EngineError> {
        Self::validate(&stages)?;

        let mut run = PipelineRun {
            id: Uuid::now_v7(),
            name: name.to_string(),
            mode,
            status: "running".to_string(),
            stage_states: stages
                .iter()
                .map(|s| (s.name.clone(), StageStatus::Pending))
                .collect(),
            stages,
            gate_failures: Vec::new(),
        };

        self.persist(&run).await?;
        self.drive(&mut run).await?;
        Ok(run)
    }

    /// Request a pause; takes effect at the next stage boundary
    pub fn pause(&self, run_id: Uuid) {
        self.paused.insert(run_id, ());
    }

    /// Continue a paused run from its persisted state
    pub async fn resume(&self, run_id: Uuid) -> Result<PipelineRun, EngineError> {
        self.paused.remove(&run_id);
        let row = self.store.get_pipeline_execution(run_id).await?;
        let mut run: PipelineRun = serde_json::from_value(row.state)?;
        if run.status != "paused" {
            return Err(ValidationError::Invalid(format!(
                "run is not paused (status {:?})",
                run.status
            ))
            .into());
        }
        run.status = "running".to_string();
        self.persist(&run).await?;
        self.drive(&mut run).await?;
        Ok(run)
    }

    async fn drive(&self, run: &mut PipelineRun) -> Result<(), EngineError> {
        loop {
            if self.paused.contains_key(&run.id) {
                run.status = "paused".to_string();
                self.persist(run).await?;
                info!(run_id = %run.id, "pipeline paused");
                return Ok(());
            }

            let completed = run.completed_set();
            let ready: Vec<PipelineStage> = run
                .stages
                .iter()
                .filter(|s| !run.is_settled(&s.name))
                .filter(|s| s.dependencies.iter().all(|d| completed.contains(d)))
                .cloned()
                .collect();

            if ready.is_empty() {
                let all_done = run
                    .stages
                    .iter()
                    .all(|s| run.stage_states.get(&s.name) == Some(&StageStatus::Completed));
                run.status = if all_done { "completed" } else { "failed" }.to_string();
                self.persist(run).await?;
                return Ok(());
            }

            let batch: Vec<PipelineStage> = match run.mode {
                ExecutionMode::Sequential => vec![ready[0].clone()],
                ExecutionMode::Parallel => ready,
            };

            // Concurrent stages all run to their own completion or timeout;
            // a blocking failure in one settles after the wave, not before.
            let results = futures::future::join_all(
                batch.iter().map(|stage| self.run_stage(stage)),
            )
            .await;

            let mut aborted = false;
            for (stage, result) in batch.iter().zip(results) {
                match result {
                    StageVerdict::Passed => {
                        run.stage_states
                            .insert(stage.name.clone(), StageStatus::Completed);
                    }
                    StageVerdict::GateFailed(failures) => {
                        run.stage_states
                            .insert(stage.name.clone(), StageStatus::Failed);
                        run.gate_failures.extend(failures);
                        aborted = true;
                    }
                    StageVerdict::Failed(error) => {
                        run.stage_states
                            .insert(stage.name.clone(), StageStatus::Failed);
                        run.gate_failures
                            .push(format!("{}: {error}", stage.name));
                        aborted = true;
                    }
                }
            }

            if aborted {
                for stage in &run.stages {
                    if !run.is_settled(&stage.name) {
                        run.stage_states
                            .insert(stage.name.clone(), StageStatus::Cancelled);
                    }
                }
                run.status = "failed".to_string();
                self.persist(run).await?;
                warn!(run_id = %run.id, failures = ?run.gate_failures, "pipeline aborted");
                return Ok(());
            }

            self.persist(run).await?;
        }
    }

    async fn run_stage(&self, stage: &PipelineStage) -> StageVerdict {
        let timeout = Duration::from_millis(stage.timeout_ms);
        let result = match tokio::time::timeout(timeout, self.runner.run(stage)).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => return StageVerdict::Failed(error),
            Err(_) => return StageVerdict::Failed("stage timed out".to_string()),
        };

        let mut failures = Vec::new();
        for gate in &stage.gates {
            let value = result.metrics.get(&gate.metric).copied();
            let passed = value
                .map(|v| gate.comparison.holds(v, gate.threshold))
                .unwrap_or(false);
            if !passed {
                let detail = format!(
                    "{}: gate {} {:?} {} failed (got {:?})",
                    stage.name, gate.metric, gate.comparison, gate.threshold, value
                );
                if gate.blocking {
                    failures.push(detail);
                } else {
                    warn!("{detail} (advisory)");
                }
            }
        }

        if failures.is_empty() {
            StageVerdict::Passed
        } else {
            StageVerdict::GateFailed(failures)
        }
    }

    async fn persist(&self, run: &PipelineRun) -> Result<(), EngineError> {
        self.store
            .save_pipeline_execution(&PipelineExecutionRow {
                id: run.id,
                name: run.name.clone(),
                status: run.status.clone(),
                state: serde_json::to_value(run)?,
                updated_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

enum StageVerdict {
    Passed,
    GateFailed(Vec<String>),
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use shipwright_storage::InMemoryStore;

    /// Runner that records execution order and serves canned results
    struct ScriptedRunner {
        order: Mutex<Vec<String>>,
        metrics: HashMap<String, HashMap<String, f64>>,
        failures: HashSet<String>,
        delay: Duration,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                order: Mutex::new(Vec::new()),
                metrics: HashMap::new(),
                failures: HashSet::new(),
                delay: Duration::ZERO,
            }
        }

        fn with_metrics(mut self, stage: &str, metric: &str, value: f64) -> Self {
            self.metrics
                .entry(stage.to_string())
                .or_default()
                .insert(metric.to_string(), value);
            self
        }

        fn failing(mut self, stage: &str) -> Self {
            self.failures.insert(stage.to_string());
            self
        }
    }

    #[async_trait]
    impl StageRunner for ScriptedRunner {
        async fn run(&self, stage: &PipelineStage) -> Result<StageRunResult, String> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.order.lock().push(stage.name.clone());
            if self.failures.contains(&stage.name) {
                return Err("scripted failure".to_string());
            }
            Ok(StageRunResult {
                metrics: self.metrics.get(&stage.name).cloned().unwrap_or_default(),
                output: serde_json::Value::Null,
            })
        }
    }

    fn stage(name: &str, deps: &[&str]) -> PipelineStage {
        PipelineStage {
            name: name.to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            gates: vec![],
            timeout_ms: 5_000,
        }
    }

    #[test]
    fn test_validate_rejects_cycles_and_unknown_deps() {
        let cyclic = vec![stage("a", &["b"]), stage("b", &["a"])];
        assert!(PipelineExecutor::validate(&cyclic).is_err());

        let dangling = vec![stage("a", &["ghost"])];
        assert!(PipelineExecutor::validate(&dangling).is_err());

        let ok = vec![stage("a", &[]), stage("b", &["a"])];
        assert!(PipelineExecutor::validate(&ok).is_ok());
    }

    #[tokio::test]
    async fn test_sequential_respects_dependency_order() {
        let runner = Arc::new(ScriptedRunner::new());
        let executor = PipelineExecutor::new(Arc::new(InMemoryStore::new()), runner.clone());

        let run = executor
            .execute(
                "build",
                vec![stage("test", &["build"]), stage("build", &[]), stage("ship", &["test"])],
                ExecutionMode::Sequential,
            )
            .await
            .expect("should run");

        assert_eq!(run.status, "completed");
        assert_eq!(
            *runner.order.lock(),
            vec!["build".to_string(), "test".to_string(), "ship".to_string()]
        );
    }

    #[tokio::test]
    async fn test_parallel_runs_independent_stages_together() {
        let runner = Arc::new(ScriptedRunner::new());
        let executor = PipelineExecutor::new(Arc::new(InMemoryStore::new()), runner.clone());

        let run = executor
            .execute(
                "fanout",
                vec![
                    stage("root", &[]),
                    stage("left", &["root"]),
                    stage("right", &["root"]),
                    stage("join", &["left", "right"]),
                ],
                ExecutionMode::Parallel,
            )
            .await
            .expect("should run");

        assert_eq!(run.status, "completed");
        let order = runner.order.lock();
        assert_eq!(order[0], "root");
        assert_eq!(order[3], "join");
    }

    #[tokio::test]
    async fn test_blocking_gate_aborts_run() {
        let runner = Arc::new(
            ScriptedRunner::new().with_metrics("test", "coverage", 0.6),
        );
        let executor = PipelineExecutor::new(Arc::new(InMemoryStore::new()), runner);

        let mut gated = stage("test", &[]);
        gated.gates.push(QualityGate {
            metric: "coverage".to_string(),
            comparison: GateComparison::Gte,
            threshold: 0.8,
            blocking: true,
        });

        let run = executor
            .execute(
                "gated",
                vec![gated, stage("ship", &["test"])],
                ExecutionMode::Sequential,
            )
            .await
            .expect("should run");

        assert_eq!(run.status, "failed");
        assert_eq!(run.stage_states["test"], StageStatus::Failed);
        assert_eq!(run.stage_states["ship"], StageStatus::Cancelled);
        assert!(!run.gate_failures.is_empty());
    }

    #[tokio::test]
    async fn test_advisory_gate_only_logs() {
        let runner = Arc::new(ScriptedRunner::new().with_metrics("test", "coverage", 0.6));
        let executor = PipelineExecutor::new(Arc::new(InMemoryStore::new()), runner);

        let mut gated = stage("test", &[]);
        gated.gates.push(QualityGate {
            metric: "coverage".to_string(),
            comparison: GateComparison::Gte,
            threshold: 0.8,
            blocking: false,
        });

        let run = executor
            .execute("advisory", vec![gated], ExecutionMode::Sequential)
            .await
            .expect("should run");
        assert_eq!(run.status, "completed");
    }

    #[tokio::test]
    async fn test_stage_failure_cancels_remaining() {
        let runner = Arc::new(ScriptedRunner::new().failing("build"));
        let executor = PipelineExecutor::new(Arc::new(InMemoryStore::new()), runner);

        let run = executor
            .execute(
                "broken",
                vec![stage("build", &[]), stage("ship", &["build"])],
                ExecutionMode::Sequential,
            )
            .await
            .expect("should run");

        assert_eq!(run.status, "failed");
        assert_eq!(run.stage_states["ship"], StageStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_timeout_converts_to_failure() {
        let mut runner = ScriptedRunner::new();
        runner.delay = Duration::from_millis(200);
        let executor = PipelineExecutor::new(Arc::new(InMemoryStore::new()), Arc::new(runner));

        let mut slow = stage("slow", &[]);
        slow.timeout_ms = 20;

        let run = executor
            .execute("timing", vec![slow], ExecutionMode::Sequential)
            .await
            .expect("should run");
        assert_eq!(run.status, "failed");
        assert!(run.gate_failures.iter().any(|f| f.contains("timed out")));
    }

    #[tokio::test]
    async fn test_pause_persists_and_resume_continues() {
        let runner = Arc::new(ScriptedRunner::new());
        let store = Arc::new(InMemoryStore::new());
        let executor = PipelineExecutor::new(store.clone(), runner.clone());

        // Pause before the run starts its loop: the first boundary check
        // parks it immediately.
        let stages = vec![stage("build", &[]), stage("ship", &["build"])];
        let run = executor
            .execute("pausable", stages.clone(), ExecutionMode::Sequential)
            .await
            .expect("should run");
        assert_eq!(run.status, "completed");

        // Drive a second run into the paused state by flagging it mid-flight
        // via the persisted row: simplest deterministic check is pausing an
        // id before execute reaches its first boundary is racy, so instead
        // verify resume on a synthetic paused row.
        let paused = PipelineRun {
            id: Uuid::now_v7(),
            name: "resumable".to_string(),
            mode: ExecutionMode::Sequential,
            status: "paused".to_string(),
            stage_states: HashMap::from([
                ("build".to_string(), StageStatus::Completed),
                ("ship".to_string(), StageStatus::Pending),
            ]),
            stages,
            gate_failures: vec![],
        };
        store
            .save_pipeline_execution(&PipelineExecutionRow {
                id: paused.id,
                name: paused.name.clone(),
                status: paused.status.clone(),
                state: serde_json::to_value(&paused).unwrap(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let resumed = executor.resume(paused.id).await.expect("should resume");
        assert_eq!(resumed.status, "completed");
        // Only the pending stage ran
        assert_eq!(*runner.order.lock(), vec!["build", "ship", "ship"]);
    }
}
