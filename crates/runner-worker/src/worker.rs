// Worker: the job message model and the top-level service that loads a job,
// registers its secrets, and hands it to the job runner.

use anyhow::{Context, Result};
use runner_common::util::task_result_util::TaskResult;
use runner_sdk::{IOUtil, TraceWriter};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::job_runner::JobRunner;
use crate::services::WorkerServices;

/// The job to run, as handed to the worker.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentJobRequestMessage {
    #[serde(default)]
    pub job_id: String,

    #[serde(default)]
    pub job_display_name: String,

    #[serde(default)]
    pub variables: HashMap<String, VariableValueMessage>,

    /// Job-level `env:`.
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,

    #[serde(default)]
    pub steps: Vec<ActionStep>,

    /// Expression contexts (`github`, `inputs`, `matrix`, ...).
    #[serde(default)]
    pub context_data: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub job_container: Option<JobContainerInfo>,

    #[serde(default)]
    pub workspace: Option<WorkspaceOptions>,
}

impl AgentJobRequestMessage {
    /// `github.repository`, e.g. `owner/repo`.
    pub fn repository(&self) -> Option<&str> {
        self.context_data
            .get("github")
            .and_then(|g| g.get("repository"))
            .and_then(|r| r.as_str())
            .filter(|r| !r.is_empty())
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableValueMessage {
    pub value: String,
    #[serde(default)]
    pub is_secret: bool,
}

/// One step of the job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStep {
    /// Unique identity of this step within the job.
    pub id: String,

    /// The `id:` users refer to in `steps.<name>`. Generated names start with `__`.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub condition: Option<String>,

    /// Literal boolean or expression.
    #[serde(default)]
    pub continue_on_error: Option<String>,

    #[serde(default)]
    pub timeout_in_minutes: Option<u32>,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default)]
    pub inputs: HashMap<String, String>,

    pub reference: ActionStepReference,
}

/// What a step runs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActionStepReference {
    #[serde(rename_all = "camelCase")]
    Script {
        script: String,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        working_directory: Option<String>,
    },
    /// `owner/repo@ref[/path]`, or `self` for the workflow repository.
    Repository {
        name: String,
        #[serde(default, rename = "ref")]
        git_ref: String,
        #[serde(default)]
        path: Option<String>,
    },
    /// `docker://image`.
    Container { image: String },
    Plugin { plugin: String },
}

impl ActionStepReference {
    /// Human-readable reference for telemetry and logs.
    pub fn describe(&self) -> String {
        match self {
            ActionStepReference::Script { .. } => "run".to_string(),
            ActionStepReference::Repository { name, git_ref, path } => match path.as_deref() {
                Some(p) if !p.is_empty() => format!("{name}/{p}@{git_ref}"),
                _ if git_ref.is_empty() => name.clone(),
                _ => format!("{name}@{git_ref}"),
            },
            ActionStepReference::Container { image } => image.clone(),
            ActionStepReference::Plugin { plugin } => plugin.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobContainerInfo {
    pub image: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceOptions {
    /// `all` or `resources`.
    #[serde(default)]
    pub clean: Option<String>,
}

pub struct Worker {
    services: Arc<WorkerServices>,
}

impl Worker {
    pub fn new(services: Arc<WorkerServices>) -> Self {
        Self { services }
    }

    /// Load the job file and run the job to completion.
    pub async fn run_async(&self, job_file: &Path) -> Result<TaskResult> {
        let trace = self.services.host.get_trace("Worker");

        let message: AgentJobRequestMessage = IOUtil::load_object(job_file)
            .with_context(|| format!("Failed to load job message from {}", job_file.display()))?;
        trace.info(&format!("Job: {} ({})", message.job_display_name, message.job_id));

        self.initialize_secrets(&message);

        let result = JobRunner::new(Arc::clone(&self.services))
            .run_async(message, self.services.host.shutdown_token())
            .await
            .unwrap_or_else(|e| {
                trace.error_chain(&e);
                TaskResult::Failed
            });

        trace.info(&format!("Worker completed with result: {result}"));
        Ok(result)
    }

    fn initialize_secrets(&self, message: &AgentJobRequestMessage) {
        let masker = self.services.host.secret_masker();
        for var in message.variables.values().filter(|v| v.is_secret) {
            masker.add_value(&var.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_job_message() {
        let json = r#"{
            "jobId": "abc-123",
            "jobDisplayName": "Build",
            "variables": {"token": {"value": "s3cr3t", "isSecret": true}},
            "contextData": {"github": {"repository": "octo/hello"}},
            "steps": [
                {
                    "id": "1",
                    "name": "test",
                    "displayName": "Run tests",
                    "condition": "success()",
                    "continueOnError": "true",
                    "timeoutInMinutes": 30,
                    "reference": {"type": "script", "script": "make test", "shell": "bash"}
                },
                {
                    "id": "2",
                    "reference": {"type": "repository", "name": "actions/checkout", "ref": "v4"}
                }
            ]
        }"#;
        let msg: AgentJobRequestMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.job_id, "abc-123");
        assert_eq!(msg.repository(), Some("octo/hello"));
        assert!(msg.variables["token"].is_secret);
        assert_eq!(msg.steps.len(), 2);
        assert_eq!(msg.steps[0].timeout_in_minutes, Some(30));
        assert_eq!(msg.steps[0].continue_on_error.as_deref(), Some("true"));
        assert_eq!(
            msg.steps[0].reference,
            ActionStepReference::Script {
                script: "make test".to_string(),
                shell: Some("bash".to_string()),
                working_directory: None,
            }
        );
        assert_eq!(msg.steps[1].reference.describe(), "actions/checkout@v4");
    }

    #[test]
    fn describe_references() {
        let with_path = ActionStepReference::Repository {
            name: "octo/tools".to_string(),
            git_ref: "main".to_string(),
            path: Some("lint".to_string()),
        };
        assert_eq!(with_path.describe(), "octo/tools/lint@main");
        let local = ActionStepReference::Repository {
            name: "self".to_string(),
            git_ref: String::new(),
            path: Some("./.github/actions/x".to_string()),
        };
        assert_eq!(local.describe(), "self/./.github/actions/x@");
        assert_eq!(
            ActionStepReference::Plugin { plugin: "upload".to_string() }.describe(),
            "upload"
        );
    }
}
