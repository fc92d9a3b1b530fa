//! Agent envelope construction
//!
//! Builds the stage-specific payload from the workflow and its prior stage
//! outputs. Each agent type has its own derivation rules; the notable one is
//! validation, whose file list is synthesized from the scaffolding output
//! and falls back to wildcard paths under the workflow's output directory.

use chrono::Utc;
use uuid::Uuid;

use shipwright_core::{
    AgentEnvelope, AgentPayload, AgentType, Task, Workflow, WorkflowContext, ENVELOPE_VERSION,
};

use crate::error::EngineError;

/// Default environment for deployments when the requirements don't name one
const DEFAULT_ENVIRONMENT: &str = "staging";

/// Builds wire envelopes for agent dispatch
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    /// Root under which per-workflow output directories live
    output_root: String,
}

impl EnvelopeBuilder {
    pub fn new(output_root: impl Into<String>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }

    fn output_dir(&self, workflow_id: Uuid) -> String {
        format!("{}/{workflow_id}", self.output_root)
    }

    /// Build the envelope for one task attempt
    pub fn build(&self, task: &Task, workflow: &Workflow) -> Result<AgentEnvelope, EngineError> {
        let outputs = workflow.outputs_by_stage();
        let payload = self.payload_for(task, workflow, &outputs)?;

        Ok(AgentEnvelope {
            id: Uuid::now_v7(),
            message_type: "task".to_string(),
            workflow_id: workflow.id,
            task_id: task.id,
            stage: task.stage.clone(),
            agent_type: task.agent_type,
            priority: task.priority,
            status: shipwright_core::TaskStatus::Pending,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            timeout_ms: task.timeout_ms,
            created_at: Utc::now(),
            trace_id: workflow.trace_id,
            envelope_version: ENVELOPE_VERSION.to_string(),
            workflow_context: WorkflowContext {
                workflow_type: workflow.workflow_type,
                workflow_name: workflow.name.clone(),
                current_stage: task.stage.clone(),
                stage_outputs: outputs,
            },
            payload,
        })
    }

    fn payload_for(
        &self,
        task: &Task,
        workflow: &Workflow,
        outputs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<AgentPayload, EngineError> {
        let output_dir = self.output_dir(workflow.id);

        match task.agent_type {
            AgentType::Scaffold => Ok(AgentPayload::Scaffold {
                action: task.action.clone(),
                app_name: workflow.name.clone(),
                requirements: workflow
                    .requirements
                    .clone()
                    .unwrap_or(serde_json::Value::Null),
                output_dir,
            }),

            AgentType::Validation => {
                let file_paths = scaffolded_files(outputs)
                    .unwrap_or_else(|| vec![format!("{output_dir}/**/*")]);
                Ok(AgentPayload::Validation {
                    file_paths,
                    output_dir,
                    strict: true,
                })
            }

            AgentType::E2e => {
                let base_url = outputs
                    .get("deployment")
                    .and_then(|o| o.get("preview_url"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let scenarios = workflow
                    .requirements
                    .as_ref()
                    .and_then(|r| r.get("e2e_scenarios"))
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|s| s.as_str().map(str::to_string))
                            .collect::<Vec<_>>()
                    })
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| vec!["smoke".to_string()]);
                Ok(AgentPayload::E2e {
                    base_url,
                    scenarios,
                    output_dir,
                })
            }

            AgentType::Integration => {
                let services = outputs
                    .get("scaffolding")
                    .and_then(|o| o.get("services_detected"))
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|s| s.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(AgentPayload::Integration {
                    services,
                    output_dir,
                })
            }

            AgentType::Deployment => {
                // Deployments refuse to run without a validation verdict
                let validation = outputs.get("validation").ok_or_else(|| {
                    EngineError::MissingUpstreamOutput {
                        stage: "validation".to_string(),
                        agent_type: AgentType::Deployment,
                    }
                })?;

                let artifact_dir = validation
                    .get("artifact_dir")
                    .or_else(|| outputs.get("scaffolding").and_then(|o| o.get("output_dir")))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| output_dir.clone());

                let environment = workflow
                    .requirements
                    .as_ref()
                    .and_then(|r| r.get("environment"))
                    .and_then(|v| v.as_str())
                    .unwrap_or(DEFAULT_ENVIRONMENT)
                    .to_string();

                Ok(AgentPayload::Deployment {
                    environment,
                    artifact_dir,
                    dry_run: false,
                })
            }
        }
    }
}

/// files-generated list from the scaffolding output, if usable
fn scaffolded_files(
    outputs: &serde_json::Map<String, serde_json::Value>,
) -> Option<Vec<String>> {
    let files: Vec<String> = outputs
        .get("scaffolding")?
        .get("files_generated")?
        .as_array()?
        .iter()
        .filter_map(|f| f.as_str().map(str::to_string))
        .collect();
    (!files.is_empty()).then_some(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shipwright_core::{StageOutput, TaskPriority, TaskStatus, WorkflowStatus, WorkflowType};

    fn workflow_with_outputs(outputs: Vec<StageOutput>) -> Workflow {
        Workflow {
            id: Uuid::now_v7(),
            workflow_type: WorkflowType::App,
            platform_id: None,
            status: WorkflowStatus::Running,
            current_stage: "validation".to_string(),
            progress: 50,
            stage_outputs: outputs,
            version: 2,
            name: "My App".to_string(),
            description: None,
            requirements: Some(serde_json::json!({ "environment": "production" })),
            created_by: None,
            trace_id: Uuid::new_v4(),
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    fn task(agent_type: AgentType, stage: &str, action: &str, workflow_id: Uuid) -> Task {
        Task {
            id: Uuid::now_v7(),
            workflow_id,
            agent_type,
            action: action.to_string(),
            stage: stage.to_string(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            timeout_ms: 120_000,
            priority: TaskPriority::Medium,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_validation_uses_scaffolded_file_list() {
        let workflow = workflow_with_outputs(vec![StageOutput {
            stage: "scaffolding".to_string(),
            output: serde_json::json!({
                "files_generated": ["src/main.rs", "Cargo.toml"]
            }),
            completed_at: Utc::now(),
        }]);
        let builder = EnvelopeBuilder::new("/workspace/out");
        let task = task(AgentType::Validation, "validation", "validate", workflow.id);

        let envelope = builder.build(&task, &workflow).expect("should build");
        match envelope.payload {
            AgentPayload::Validation { file_paths, .. } => {
                assert_eq!(file_paths, vec!["src/main.rs", "Cargo.toml"]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_validation_falls_back_to_wildcard() {
        let workflow = workflow_with_outputs(vec![]);
        let builder = EnvelopeBuilder::new("/workspace/out");
        let task = task(AgentType::Validation, "validation", "validate", workflow.id);

        let envelope = builder.build(&task, &workflow).expect("should build");
        match envelope.payload {
            AgentPayload::Validation { file_paths, .. } => {
                assert_eq!(
                    file_paths,
                    vec![format!("/workspace/out/{}/**/*", workflow.id)]
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_deployment_requires_validation_output() {
        let workflow = workflow_with_outputs(vec![]);
        let builder = EnvelopeBuilder::new("/workspace/out");
        let task = task(AgentType::Deployment, "deployment", "deploy", workflow.id);

        let err = builder.build(&task, &workflow).expect_err("should fail");
        assert!(matches!(err, EngineError::MissingUpstreamOutput { .. }));
    }

    #[test]
    fn test_deployment_takes_environment_from_requirements() {
        let workflow = workflow_with_outputs(vec![StageOutput {
            stage: "validation".to_string(),
            output: serde_json::json!({ "artifact_dir": "/artifacts/build-7" }),
            completed_at: Utc::now(),
        }]);
        let builder = EnvelopeBuilder::new("/workspace/out");
        let task = task(AgentType::Deployment, "deployment", "deploy", workflow.id);

        let envelope = builder.build(&task, &workflow).expect("should build");
        match envelope.payload {
            AgentPayload::Deployment {
                environment,
                artifact_dir,
                ..
            } => {
                assert_eq!(environment, "production");
                assert_eq!(artifact_dir, "/artifacts/build-7");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_scaffold_action_follows_task() {
        let workflow = workflow_with_outputs(vec![]);
        let builder = EnvelopeBuilder::new("/workspace/out");
        let task = task(AgentType::Scaffold, "initialization", "initialize", workflow.id);

        let envelope = builder.build(&task, &workflow).expect("should build");
        assert_eq!(envelope.envelope_version, "1.0.0");
        assert_eq!(envelope.trace_id, workflow.trace_id);
        match envelope.payload {
            AgentPayload::Scaffold { action, app_name, .. } => {
                assert_eq!(action, "initialize");
                assert_eq!(app_name, "My App");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_context_carries_prior_outputs() {
        let workflow = workflow_with_outputs(vec![StageOutput {
            stage: "initialization".to_string(),
            output: serde_json::json!({ "plan": "ok" }),
            completed_at: Utc::now(),
        }]);
        let builder = EnvelopeBuilder::new("/workspace/out");
        let task = task(AgentType::Scaffold, "scaffolding", "scaffold", workflow.id);

        let envelope = builder.build(&task, &workflow).expect("should build");
        assert!(envelope
            .workflow_context
            .stage_outputs
            .contains_key("initialization"));
    }
}
