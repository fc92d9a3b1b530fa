//! Built-in fallback definitions
//!
//! Used when no stored definition exists for a (platform, workflow_type).
//! This is a data table: routing for a new workflow type is added here (or
//! by a definition row migration), never by branching in the engine.

use std::collections::HashMap;
use std::sync::Arc;

use shipwright_core::{AgentType, WorkflowType};

use crate::definition::{ProgressCalculation, StageDefinition, WorkflowDefinition};

fn stage(
    name: &str,
    display_name: &str,
    agent_type: AgentType,
    weight: u32,
    timeout_ms: u64,
) -> StageDefinition {
    StageDefinition {
        name: name.to_string(),
        display_name: display_name.to_string(),
        agent_type,
        required: true,
        progress_weight: weight,
        timeout_ms,
        condition: None,
    }
}

/// The legacy stage table, one ordered definition per workflow type
pub fn legacy_definitions() -> HashMap<WorkflowType, Arc<WorkflowDefinition>> {
    let table = [
        (
            WorkflowType::App,
            vec![
                stage("initialization", "Initialization", AgentType::Scaffold, 25, 120_000),
                stage("scaffolding", "Scaffolding", AgentType::Scaffold, 25, 300_000),
                stage("validation", "Validation", AgentType::Validation, 25, 180_000),
                stage("deployment", "Deployment", AgentType::Deployment, 25, 240_000),
            ],
        ),
        (
            WorkflowType::Feature,
            vec![
                stage("initialization", "Initialization", AgentType::Scaffold, 20, 120_000),
                stage("scaffolding", "Implementation", AgentType::Scaffold, 30, 300_000),
                stage("validation", "Validation", AgentType::Validation, 25, 180_000),
                stage("integration", "Integration", AgentType::Integration, 25, 240_000),
            ],
        ),
        (
            WorkflowType::Bugfix,
            vec![
                stage("initialization", "Reproduction", AgentType::Scaffold, 25, 120_000),
                stage("scaffolding", "Fix", AgentType::Scaffold, 35, 300_000),
                stage("validation", "Validation", AgentType::Validation, 25, 180_000),
                stage("e2e", "Regression", AgentType::E2e, 15, 300_000),
            ],
        ),
        (
            WorkflowType::Pipeline,
            vec![
                stage("validation", "Validation", AgentType::Validation, 30, 180_000),
                stage("e2e", "End To End", AgentType::E2e, 30, 300_000),
                stage("deployment", "Deployment", AgentType::Deployment, 40, 240_000),
            ],
        ),
        (
            WorkflowType::Terraform,
            vec![
                stage("initialization", "Plan", AgentType::Scaffold, 30, 120_000),
                stage("validation", "Validation", AgentType::Validation, 30, 180_000),
                stage("deployment", "Apply", AgentType::Deployment, 40, 300_000),
            ],
        ),
    ];

    table
        .into_iter()
        .map(|(workflow_type, stages)| {
            (
                workflow_type,
                Arc::new(WorkflowDefinition {
                    workflow_type,
                    platform_id: None,
                    stages,
                    progress_calculation: ProgressCalculation::Weighted,
                }),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_workflow_type_has_a_fallback() {
        let table = legacy_definitions();
        for ty in [
            WorkflowType::App,
            WorkflowType::Feature,
            WorkflowType::Bugfix,
            WorkflowType::Pipeline,
            WorkflowType::Terraform,
        ] {
            let def = table.get(&ty).expect("missing fallback");
            let report = def.validate();
            assert!(report.valid, "{ty}: {:?}", report.errors);
        }
    }

    #[test]
    fn test_app_fallback_is_four_equal_stages() {
        let table = legacy_definitions();
        let app = table.get(&WorkflowType::App).unwrap();
        assert_eq!(app.stages.len(), 4);
        assert!(app.stages.iter().all(|s| s.progress_weight == 25));
        assert_eq!(app.stages[0].name, "initialization");
        assert_eq!(app.stages[1].name, "scaffolding");
    }
}
