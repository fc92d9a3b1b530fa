//! Progress percentage math
//!
//! All calculations clamp to 0..=100. The weighted base counts the current
//! stage's weight as earned, so a four-stage 25/25/25/25 workflow sits at 50
//! while its second stage runs.

use crate::definition::{ProgressCalculation, WorkflowDefinition};

/// Percentage for the stage at `index` (0-based) under the definition's
/// calculation mode
pub(crate) fn percentage_at(definition: &WorkflowDefinition, index: usize) -> i32 {
    let total_stages = definition.stages.len();
    if total_stages == 0 || index >= total_stages {
        return 0;
    }

    let raw = match definition.progress_calculation {
        ProgressCalculation::Weighted | ProgressCalculation::Custom => {
            weighted_base(definition, index)
        }
        ProgressCalculation::Linear => 100.0 * (index as f64 + 1.0) / total_stages as f64,
        ProgressCalculation::Exponential => {
            100.0 * ((index as f64 + 1.0) / total_stages as f64).powf(0.8)
        }
    };

    (raw.round() as i32).clamp(0, 100)
}

/// Cumulative weight through `index`, as a percentage of total weight
fn weighted_base(definition: &WorkflowDefinition, index: usize) -> f64 {
    let total = definition.total_weight();
    if total == 0 {
        return 0.0;
    }
    let cumulative = cumulative_weight(definition, index);
    100.0 * cumulative as f64 / total as f64
}

pub(crate) fn cumulative_weight(definition: &WorkflowDefinition, index: usize) -> u64 {
    definition
        .stages
        .iter()
        .take(index + 1)
        .map(|s| s.progress_weight as u64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StageDefinition;
    use shipwright_core::{AgentType, WorkflowType};

    fn definition(weights: &[u32], calc: ProgressCalculation) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_type: WorkflowType::App,
            platform_id: None,
            stages: weights
                .iter()
                .enumerate()
                .map(|(i, w)| StageDefinition {
                    name: format!("stage-{i}"),
                    display_name: format!("Stage {i}"),
                    agent_type: AgentType::Scaffold,
                    required: true,
                    progress_weight: *w,
                    timeout_ms: 60_000,
                    condition: None,
                })
                .collect(),
            progress_calculation: calc,
        }
    }

    #[test]
    fn test_weighted_equal_weights() {
        let def = definition(&[25, 25, 25, 25], ProgressCalculation::Weighted);
        assert_eq!(percentage_at(&def, 0), 25);
        assert_eq!(percentage_at(&def, 1), 50);
        assert_eq!(percentage_at(&def, 2), 75);
        assert_eq!(percentage_at(&def, 3), 100);
    }

    #[test]
    fn test_weighted_uneven_weights() {
        let def = definition(&[10, 60, 30], ProgressCalculation::Weighted);
        assert_eq!(percentage_at(&def, 0), 10);
        assert_eq!(percentage_at(&def, 1), 70);
        assert_eq!(percentage_at(&def, 2), 100);
    }

    #[test]
    fn test_weighted_rounds() {
        let def = definition(&[1, 1, 1], ProgressCalculation::Weighted);
        // 33.33 -> 33, 66.67 -> 67
        assert_eq!(percentage_at(&def, 0), 33);
        assert_eq!(percentage_at(&def, 1), 67);
        assert_eq!(percentage_at(&def, 2), 100);
    }

    #[test]
    fn test_linear() {
        let def = definition(&[10, 60, 30], ProgressCalculation::Linear);
        assert_eq!(percentage_at(&def, 0), 33);
        assert_eq!(percentage_at(&def, 1), 67);
        assert_eq!(percentage_at(&def, 2), 100);
    }

    #[test]
    fn test_exponential_is_front_loaded() {
        let def = definition(&[25, 25, 25, 25], ProgressCalculation::Exponential);
        // (1/4)^0.8 = 0.3299 -> 33
        assert_eq!(percentage_at(&def, 0), 33);
        assert!(percentage_at(&def, 1) > 50);
        assert_eq!(percentage_at(&def, 3), 100);
    }

    #[test]
    fn test_out_of_range_index_is_zero() {
        let def = definition(&[25, 25], ProgressCalculation::Weighted);
        assert_eq!(percentage_at(&def, 5), 0);
    }
}
