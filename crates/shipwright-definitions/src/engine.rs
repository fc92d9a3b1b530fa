//! Definition lookups, caching, and next-stage resolution

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use shipwright_core::{AgentType, WorkflowType};
use shipwright_storage::{OrchestratorStore, StoreError};

use crate::definition::{ValidationReport, WorkflowDefinition};
use crate::legacy::legacy_definitions;
use crate::progress::{cumulative_weight, percentage_at};

/// Answer to "what runs after `current_stage`?"
#[derive(Debug, Clone, PartialEq)]
pub struct NextStage {
    /// `None` means the workflow is terminal after `current_stage`
    pub next_stage: Option<String>,

    /// Index of `current_stage` in the definition; -1 when unknown
    pub stage_index: i32,

    pub total_stages: usize,

    /// Agent pool for the next stage
    pub agent_type: Option<AgentType>,

    /// Timeout for the next stage
    pub timeout_ms: Option<u64>,

    /// Progress the workflow will show once at the next stage
    pub expected_progress: i32,

    /// True when one or more conditional stages were skipped over
    pub should_skip: bool,
}

/// Answer to "how far along is `current_stage`?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageProgress {
    /// -1 when the stage is not in the definition
    pub stage_index: i32,
    pub total_stages: usize,
    pub progress_percentage: i32,
    pub cumulative_weight: u64,
    pub total_weight: u64,
}

/// Cached, platform-scoped definition lookups
///
/// Shared read-only after load; the cache is invalidated only by explicit
/// clear. Lookups that find no stored definition fall back to the legacy
/// table keyed by workflow type.
pub struct DefinitionEngine {
    store: Arc<dyn OrchestratorStore>,
    cache: RwLock<HashMap<(Option<Uuid>, WorkflowType), Arc<WorkflowDefinition>>>,
    legacy: HashMap<WorkflowType, Arc<WorkflowDefinition>>,
}

impl DefinitionEngine {
    pub fn new(store: Arc<dyn OrchestratorStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            legacy: legacy_definitions(),
        }
    }

    /// Stored definition for (platform, workflow_type), cached
    ///
    /// `None` permits the legacy fallback; a stored definition that fails to
    /// parse or validate is treated as absent (logged, not fatal).
    pub async fn get_definition(
        &self,
        platform_id: Option<Uuid>,
        workflow_type: WorkflowType,
    ) -> Result<Option<Arc<WorkflowDefinition>>, StoreError> {
        if let Some(cached) = self.cache.read().get(&(platform_id, workflow_type)) {
            return Ok(Some(cached.clone()));
        }

        let Some(row) = self.store.get_definition(platform_id, workflow_type).await? else {
            return Ok(None);
        };

        let definition: WorkflowDefinition = match serde_json::from_value(row.definition) {
            Ok(def) => def,
            Err(e) => {
                warn!(%workflow_type, ?platform_id, error = %e, "stored definition failed to parse; using fallback");
                return Ok(None);
            }
        };

        let report = definition.validate();
        if !report.valid {
            warn!(%workflow_type, ?platform_id, errors = ?report.errors, "stored definition invalid; using fallback");
            return Ok(None);
        }

        let definition = Arc::new(definition);
        self.cache
            .write()
            .insert((platform_id, workflow_type), definition.clone());
        Ok(Some(definition))
    }

    /// Definition with legacy fallback; `None` only for a workflow type
    /// missing from both the store and the legacy table
    pub async fn resolve(
        &self,
        platform_id: Option<Uuid>,
        workflow_type: WorkflowType,
    ) -> Result<Option<Arc<WorkflowDefinition>>, StoreError> {
        if let Some(definition) = self.get_definition(platform_id, workflow_type).await? {
            return Ok(Some(definition));
        }
        debug!(%workflow_type, ?platform_id, "no stored definition; using legacy table");
        Ok(self.legacy.get(&workflow_type).cloned())
    }

    /// First runnable stage of a definition, honoring conditions
    pub fn first_stage<'a>(
        &self,
        definition: &'a WorkflowDefinition,
        outputs: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<&'a crate::definition::StageDefinition> {
        definition
            .stages
            .iter()
            .find(|s| s.condition.as_ref().map(|c| c.holds(outputs)).unwrap_or(true))
    }

    /// Next runnable stage after `current_stage`
    ///
    /// Conditional stages whose predicate fails against `outputs` are
    /// skipped over (their weight still counts as earned); `should_skip`
    /// reports that at least one skip happened.
    pub async fn next_stage(
        &self,
        platform_id: Option<Uuid>,
        workflow_type: WorkflowType,
        current_stage: &str,
        outputs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<NextStage, StoreError> {
        let Some(definition) = self.resolve(platform_id, workflow_type).await? else {
            return Ok(NextStage {
                next_stage: None,
                stage_index: -1,
                total_stages: 0,
                agent_type: None,
                timeout_ms: None,
                expected_progress: 0,
                should_skip: false,
            });
        };

        let total_stages = definition.stages.len();
        let Some(current_index) = definition.stage_index(current_stage) else {
            return Ok(NextStage {
                next_stage: None,
                stage_index: -1,
                total_stages,
                agent_type: None,
                timeout_ms: None,
                expected_progress: 0,
                should_skip: false,
            });
        };

        let mut skipped = false;
        for (offset, stage) in definition.stages[current_index + 1..].iter().enumerate() {
            let runnable = stage
                .condition
                .as_ref()
                .map(|c| c.holds(outputs))
                .unwrap_or(true);
            if !runnable {
                skipped = true;
                continue;
            }

            let next_index = current_index + 1 + offset;
            return Ok(NextStage {
                next_stage: Some(stage.name.clone()),
                stage_index: current_index as i32,
                total_stages,
                agent_type: Some(stage.agent_type),
                timeout_ms: Some(stage.timeout_ms),
                expected_progress: percentage_at(&definition, next_index),
                should_skip: skipped,
            });
        }

        // Nothing runnable remains: terminal
        Ok(NextStage {
            next_stage: None,
            stage_index: current_index as i32,
            total_stages,
            agent_type: None,
            timeout_ms: None,
            expected_progress: 100,
            should_skip: skipped,
        })
    }

    /// Progress for `current_stage` under the active definition
    pub async fn progress(
        &self,
        platform_id: Option<Uuid>,
        workflow_type: WorkflowType,
        current_stage: &str,
    ) -> Result<StageProgress, StoreError> {
        let Some(definition) = self.resolve(platform_id, workflow_type).await? else {
            return Ok(StageProgress {
                stage_index: -1,
                total_stages: 0,
                progress_percentage: 0,
                cumulative_weight: 0,
                total_weight: 0,
            });
        };

        let total_stages = definition.stages.len();
        let total_weight = definition.total_weight();

        let Some(index) = definition.stage_index(current_stage) else {
            return Ok(StageProgress {
                stage_index: -1,
                total_stages,
                progress_percentage: 0,
                cumulative_weight: 0,
                total_weight,
            });
        };

        Ok(StageProgress {
            stage_index: index as i32,
            total_stages,
            progress_percentage: percentage_at(&definition, index),
            cumulative_weight: cumulative_weight(&definition, index),
            total_weight,
        })
    }

    /// Validate a candidate definition
    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        definition.validate()
    }

    /// Drop one cached entry
    pub fn invalidate(&self, platform_id: Option<Uuid>, workflow_type: WorkflowType) {
        self.cache.write().remove(&(platform_id, workflow_type));
    }

    /// Drop the whole cache (shutdown, bulk definition reload)
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ProgressCalculation, StageCondition, StageDefinition};
    use shipwright_storage::{DefinitionRow, InMemoryStore};

    fn engine() -> DefinitionEngine {
        DefinitionEngine::new(Arc::new(InMemoryStore::new()))
    }

    fn engine_with_store(store: Arc<InMemoryStore>) -> DefinitionEngine {
        DefinitionEngine::new(store)
    }

    fn no_outputs() -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    #[tokio::test]
    async fn test_legacy_fallback_next_stage() {
        let engine = engine();

        let next = engine
            .next_stage(None, WorkflowType::App, "initialization", &no_outputs())
            .await
            .unwrap();

        assert_eq!(next.next_stage.as_deref(), Some("scaffolding"));
        assert_eq!(next.stage_index, 0);
        assert_eq!(next.total_stages, 4);
        assert_eq!(next.agent_type, Some(AgentType::Scaffold));
        assert_eq!(next.expected_progress, 50);
        assert!(!next.should_skip);
    }

    #[tokio::test]
    async fn test_terminal_after_last_stage() {
        let engine = engine();

        let next = engine
            .next_stage(None, WorkflowType::App, "deployment", &no_outputs())
            .await
            .unwrap();

        assert_eq!(next.next_stage, None);
        assert_eq!(next.stage_index, 3);
        assert_eq!(next.expected_progress, 100);
    }

    #[tokio::test]
    async fn test_unknown_stage_reports_negative_index() {
        let engine = engine();

        let next = engine
            .next_stage(None, WorkflowType::App, "not-a-stage", &no_outputs())
            .await
            .unwrap();
        assert_eq!(next.stage_index, -1);
        assert_eq!(next.next_stage, None);

        let progress = engine
            .progress(None, WorkflowType::App, "not-a-stage")
            .await
            .unwrap();
        assert_eq!(progress.stage_index, -1);
        assert_eq!(progress.progress_percentage, 0);
    }

    #[tokio::test]
    async fn test_progress_on_legacy_app() {
        let engine = engine();

        let progress = engine
            .progress(None, WorkflowType::App, "scaffolding")
            .await
            .unwrap();
        assert_eq!(progress.stage_index, 1);
        assert_eq!(progress.total_stages, 4);
        assert_eq!(progress.progress_percentage, 50);
        assert_eq!(progress.cumulative_weight, 50);
        assert_eq!(progress.total_weight, 100);
    }

    #[tokio::test]
    async fn test_stored_definition_wins_over_legacy() {
        let store = Arc::new(InMemoryStore::new());
        let custom = WorkflowDefinition {
            workflow_type: WorkflowType::App,
            platform_id: None,
            stages: vec![
                StageDefinition {
                    name: "plan".to_string(),
                    display_name: "Plan".to_string(),
                    agent_type: AgentType::Scaffold,
                    required: true,
                    progress_weight: 40,
                    timeout_ms: 60_000,
                    condition: None,
                },
                StageDefinition {
                    name: "ship".to_string(),
                    display_name: "Ship".to_string(),
                    agent_type: AgentType::Deployment,
                    required: true,
                    progress_weight: 60,
                    timeout_ms: 60_000,
                    condition: None,
                },
            ],
            progress_calculation: ProgressCalculation::Weighted,
        };
        store
            .put_definition(&DefinitionRow {
                platform_id: None,
                workflow_type: WorkflowType::App,
                definition: serde_json::to_value(&custom).unwrap(),
            })
            .await
            .unwrap();

        let engine = engine_with_store(store);
        let next = engine
            .next_stage(None, WorkflowType::App, "plan", &no_outputs())
            .await
            .unwrap();
        assert_eq!(next.next_stage.as_deref(), Some("ship"));
        assert_eq!(next.agent_type, Some(AgentType::Deployment));
        assert_eq!(next.expected_progress, 100);
    }

    #[tokio::test]
    async fn test_invalid_stored_definition_falls_back() {
        let store = Arc::new(InMemoryStore::new());
        store
            .put_definition(&DefinitionRow {
                platform_id: None,
                workflow_type: WorkflowType::App,
                definition: serde_json::json!({ "bogus": true }),
            })
            .await
            .unwrap();

        let engine = engine_with_store(store);
        let next = engine
            .next_stage(None, WorkflowType::App, "initialization", &no_outputs())
            .await
            .unwrap();
        // Legacy app definition applies
        assert_eq!(next.next_stage.as_deref(), Some("scaffolding"));
    }

    #[tokio::test]
    async fn test_conditional_stage_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let custom = WorkflowDefinition {
            workflow_type: WorkflowType::Bugfix,
            platform_id: None,
            stages: vec![
                StageDefinition {
                    name: "fix".to_string(),
                    display_name: "Fix".to_string(),
                    agent_type: AgentType::Scaffold,
                    required: true,
                    progress_weight: 50,
                    timeout_ms: 60_000,
                    condition: None,
                },
                StageDefinition {
                    name: "e2e".to_string(),
                    display_name: "Regression".to_string(),
                    agent_type: AgentType::E2e,
                    required: false,
                    progress_weight: 20,
                    timeout_ms: 60_000,
                    condition: Some(StageCondition {
                        source_stage: "fix".to_string(),
                        field: "needs_e2e".to_string(),
                        equals: serde_json::json!(true),
                    }),
                },
                StageDefinition {
                    name: "deployment".to_string(),
                    display_name: "Deploy".to_string(),
                    agent_type: AgentType::Deployment,
                    required: true,
                    progress_weight: 30,
                    timeout_ms: 60_000,
                    condition: None,
                },
            ],
            progress_calculation: ProgressCalculation::Weighted,
        };
        store
            .put_definition(&DefinitionRow {
                platform_id: None,
                workflow_type: WorkflowType::Bugfix,
                definition: serde_json::to_value(&custom).unwrap(),
            })
            .await
            .unwrap();

        let engine = engine_with_store(store);

        // Without the flag the e2e stage is skipped straight to deployment
        let mut outputs = serde_json::Map::new();
        outputs.insert("fix".to_string(), serde_json::json!({ "needs_e2e": false }));
        let next = engine
            .next_stage(None, WorkflowType::Bugfix, "fix", &outputs)
            .await
            .unwrap();
        assert_eq!(next.next_stage.as_deref(), Some("deployment"));
        assert!(next.should_skip);
        // Skipped weight still counts as earned
        assert_eq!(next.expected_progress, 100);

        // With the flag the e2e stage runs
        outputs.insert("fix".to_string(), serde_json::json!({ "needs_e2e": true }));
        let next = engine
            .next_stage(None, WorkflowType::Bugfix, "fix", &outputs)
            .await
            .unwrap();
        assert_eq!(next.next_stage.as_deref(), Some("e2e"));
        assert!(!next.should_skip);
    }

    #[tokio::test]
    async fn test_cache_invalidation_picks_up_new_definition() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with_store(store.clone());

        // Prime the cache with the legacy fallback path (nothing stored)
        let first = engine
            .get_definition(None, WorkflowType::App)
            .await
            .unwrap();
        assert!(first.is_none());

        let custom = WorkflowDefinition {
            workflow_type: WorkflowType::App,
            platform_id: None,
            stages: vec![StageDefinition {
                name: "only".to_string(),
                display_name: "Only".to_string(),
                agent_type: AgentType::Scaffold,
                required: true,
                progress_weight: 100,
                timeout_ms: 60_000,
                condition: None,
            }],
            progress_calculation: ProgressCalculation::Weighted,
        };
        store
            .put_definition(&DefinitionRow {
                platform_id: None,
                workflow_type: WorkflowType::App,
                definition: serde_json::to_value(&custom).unwrap(),
            })
            .await
            .unwrap();

        engine.invalidate(None, WorkflowType::App);
        let reloaded = engine
            .get_definition(None, WorkflowType::App)
            .await
            .unwrap()
            .expect("should load stored definition");
        assert_eq!(reloaded.stages.len(), 1);
    }
}
