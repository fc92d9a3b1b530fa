//! Definition types and validation

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shipwright_core::{AgentType, WorkflowType};

/// How a base percentage is derived from stage position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressCalculation {
    /// Cumulative stage weights over total weight (primary)
    Weighted,
    /// Position over stage count
    Linear,
    /// Position over stage count, raised to 0.8 (front-loaded)
    Exponential,
    /// Pass the weighted base through untouched; consumers post-process
    Custom,
}

impl Default for ProgressCalculation {
    fn default() -> Self {
        Self::Weighted
    }
}

/// Predicate deciding whether a conditional stage runs
///
/// Evaluated against prior stage outputs: the stage is skipped unless
/// `outputs[source_stage][field] == equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCondition {
    pub source_stage: String,
    pub field: String,
    pub equals: serde_json::Value,
}

impl StageCondition {
    /// True when the stage should run given the outputs seen so far
    pub fn holds(&self, outputs: &serde_json::Map<String, serde_json::Value>) -> bool {
        outputs
            .get(&self.source_stage)
            .and_then(|o| o.get(&self.field))
            .map(|v| *v == self.equals)
            .unwrap_or(false)
    }
}

/// One step of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub display_name: String,
    pub agent_type: AgentType,

    /// Required stages must have an output for the workflow to complete
    #[serde(default = "default_required")]
    pub required: bool,

    pub progress_weight: u32,
    pub timeout_ms: u64,

    /// Optional predicate; absent means the stage always runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StageCondition>,
}

fn default_required() -> bool {
    true
}

/// Ordered, weighted stage list for one (platform, workflow_type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_type: WorkflowType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<Uuid>,

    pub stages: Vec<StageDefinition>,

    #[serde(default)]
    pub progress_calculation: ProgressCalculation,
}

/// Outcome of definition validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl WorkflowDefinition {
    /// Index of a stage by name, if present
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn total_weight(&self) -> u64 {
        self.stages.iter().map(|s| s.progress_weight as u64).sum()
    }

    /// Enforce unique stage names, non-empty stages, positive total weight
    pub fn validate(&self) -> ValidationReport {
        let mut errors = Vec::new();

        if self.stages.is_empty() {
            errors.push("definition has no stages".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                errors.push(format!("duplicate stage name: {}", stage.name));
            }
            if stage.name.is_empty() {
                errors.push("stage with empty name".to_string());
            }
        }

        if !self.stages.is_empty() && self.total_weight() == 0 {
            errors.push("total progress weight must be positive".to_string());
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, weight: u32) -> StageDefinition {
        StageDefinition {
            name: name.to_string(),
            display_name: name.to_string(),
            agent_type: AgentType::Scaffold,
            required: true,
            progress_weight: weight,
            timeout_ms: 60_000,
            condition: None,
        }
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let def = WorkflowDefinition {
            workflow_type: WorkflowType::App,
            platform_id: None,
            stages: vec![stage("a", 50), stage("b", 50)],
            progress_calculation: ProgressCalculation::Weighted,
        };
        let report = def.validate();
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn test_validate_rejects_empty() {
        let def = WorkflowDefinition {
            workflow_type: WorkflowType::App,
            platform_id: None,
            stages: vec![],
            progress_calculation: ProgressCalculation::Weighted,
        };
        assert!(!def.validate().valid);
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let def = WorkflowDefinition {
            workflow_type: WorkflowType::App,
            platform_id: None,
            stages: vec![stage("a", 50), stage("a", 50)],
            progress_calculation: ProgressCalculation::Weighted,
        };
        let report = def.validate();
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn test_validate_rejects_zero_total_weight() {
        let def = WorkflowDefinition {
            workflow_type: WorkflowType::App,
            platform_id: None,
            stages: vec![stage("a", 0), stage("b", 0)],
            progress_calculation: ProgressCalculation::Weighted,
        };
        assert!(!def.validate().valid);
    }

    #[test]
    fn test_condition_holds_against_outputs() {
        let condition = StageCondition {
            source_stage: "validation".to_string(),
            field: "needs_e2e".to_string(),
            equals: serde_json::json!(true),
        };

        let mut outputs = serde_json::Map::new();
        assert!(!condition.holds(&outputs));

        outputs.insert("validation".to_string(), serde_json::json!({ "needs_e2e": true }));
        assert!(condition.holds(&outputs));

        outputs.insert("validation".to_string(), serde_json::json!({ "needs_e2e": false }));
        assert!(!condition.holds(&outputs));
    }
}
