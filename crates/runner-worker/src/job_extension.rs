// JobExtension: sets a job up before its steps run and cleans up after.
//
// Initialization runs in its own "Set up job" step context. It prepares the
// job's directories, publishes the job container, and queues the setup,
// pre and main steps plus the job-finalization step.

use anyhow::{bail, Result};
use runner_common::constants::{WellKnownDirectory, CURRENT_PLATFORM};
use runner_common::util::task_result_util::TaskResult;
use runner_sdk::{IOUtil, StringUtil};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::action_runner::ActionRunner;
use crate::container::ContainerInfo;
use crate::execution_context::{ExecutionContext, IStep};
use crate::handlers::handler::ActionRunStage;
use crate::worker::AgentJobRequestMessage;

/// Where the work directory is mounted inside the job container.
pub const CONTAINER_WORK_DIRECTORY: &str = "/__w";

pub struct JobExtension;

impl JobExtension {
    pub fn new() -> Self {
        Self
    }

    /// Prepare the job. An error here means no step runs; the "Set up job"
    /// record carries the failure.
    pub fn initialize_job(&self, job: &mut ExecutionContext, message: &AgentJobRequestMessage) -> Result<()> {
        let mut context = job.create_child("Set up job", "", "", None);
        context.start();
        match self.initialize(&mut context, message) {
            Ok(()) => {
                context.complete(None);
                Ok(())
            }
            Err(e) => {
                context.error_chain(&e);
                context.complete(Some(TaskResult::Failed));
                Err(e)
            }
        }
    }

    fn initialize(&self, context: &mut ExecutionContext, message: &AgentJobRequestMessage) -> Result<()> {
        let services = Arc::clone(context.services());
        context.output(&format!("Current runner version: '{}'", env!("CARGO_PKG_VERSION")));
        context.output(&format!("Operating system: {CURRENT_PLATFORM}"));

        services
            .directory_manager
            .prepare_directory(context, message.workspace.as_ref())?;

        if let Some(job_container) = &message.job_container {
            if !CURRENT_PLATFORM.supports_containers() {
                bail!("Container operations are only supported on Linux runners, not on {CURRENT_PLATFORM}");
            }
            let mut container = ContainerInfo::new(&job_container.image);
            container.environment = job_container.environment.clone();
            container.is_job_container = true;
            container.add_path_mapping(services.host.work_directory(), CONTAINER_WORK_DIRECTORY);
            context.debug(&format!("Job container image: '{}'", container.image));
            context.global_mut().container_info = Some(container);
        }

        let job_image = message.job_container.as_ref().map(|c| c.image.as_str());
        let setup_steps = services
            .action_manager
            .prepare_actions(context, &message.steps, job_image)?;

        let mut pre_steps: Vec<Arc<dyn IStep>> = Vec::new();
        let mut main_steps: Vec<Arc<dyn IStep>> = Vec::new();
        for step in &message.steps {
            let step = Arc::new(step.clone());
            let loaded = services.action_manager.load_action(context, &step)?;
            if loaded.definition.execution.has_pre() {
                let pre = ActionRunner::new(Arc::clone(&step), ActionRunStage::Pre)
                    .with_condition(loaded.definition.execution.pre_condition());
                pre_steps.push(Arc::new(pre));
            }
            main_steps.push(Arc::new(ActionRunner::new(step, ActionRunStage::Main)));
        }

        context.output(&format!(
            "Queued {} setup, {} pre and {} main step(s)",
            setup_steps.len(),
            pre_steps.len(),
            main_steps.len()
        ));
        for step in setup_steps.into_iter().chain(pre_steps).chain(main_steps) {
            context.enqueue_job_step(step);
        }

        // First in, last out: finalization runs after every post step.
        context.register_post_job_step(Arc::new(JobFinalizeStep::new()));
        Ok(())
    }

    /// Report step telemetry and remove the job's temp directory.
    pub fn finalize_job(&self, context: &mut ExecutionContext) -> Result<()> {
        let telemetry = context.global().job_telemetry.clone();
        match StringUtil::convert_to_json(&telemetry) {
            Ok(json) => context.debug(&format!("Job telemetry: {json}")),
            Err(e) => context.debug(&format!("Unable to serialize job telemetry: {e}")),
        }
        tracing::info!(steps = telemetry.len(), "Job telemetry collected");

        let temp = context.services().host.get_directory(WellKnownDirectory::Temp);
        context.output(&format!("Cleaning up temp directory '{}'", temp.display()));
        if let Err(e) = IOUtil::delete_directory(&temp) {
            context.warning(&format!("Failed to delete temp directory '{}': {e}", temp.display()));
        }
        Ok(())
    }
}

/// The last post-job step.
pub struct JobFinalizeStep {
    id: String,
}

impl JobFinalizeStep {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl IStep for JobFinalizeStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> String {
        "Complete job".to_string()
    }

    fn condition(&self) -> Option<&str> {
        Some("always()")
    }

    fn run_async<'a>(
        &'a self,
        context: &'a mut ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { JobExtension::new().finalize_job(context) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{script_step, TestHost};
    use crate::worker::{ActionStep, ActionStepReference, JobContainerInfo};

    fn message(steps: Vec<ActionStep>) -> AgentJobRequestMessage {
        let mut message = AgentJobRequestMessage {
            job_id: "job".to_string(),
            job_display_name: "Build".to_string(),
            steps,
            ..AgentJobRequestMessage::default()
        };
        message
            .context_data
            .insert("github".to_string(), serde_json::json!({"repository": "octo/hello"}));
        message
    }

    fn job_for(host: &TestHost, message: &AgentJobRequestMessage) -> ExecutionContext {
        let job = host.job_context();
        job.global_mut().context_data = message.context_data.clone();
        job
    }

    fn node_action(id: &str) -> ActionStep {
        ActionStep {
            reference: ActionStepReference::Repository {
                name: "octo/node".to_string(),
                git_ref: "v1".to_string(),
                path: None,
            },
            ..script_step(id, "")
        }
    }

    #[test]
    fn queues_pre_main_and_finalize_steps() {
        let actions = tempfile::tempdir().unwrap();
        let dir = actions.path().join("octo/node/v1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("action.yml"),
            "runs:\n  using: node20\n  pre: setup.js\n  main: index.js\n",
        )
        .unwrap();

        let host = TestHost::with_actions_directory(actions.path());
        let message = message(vec![script_step("build", "make"), node_action("node")]);
        let mut job = job_for(&host, &message);

        JobExtension::new().initialize_job(&mut job, &message).unwrap();

        let names: Vec<_> = std::iter::from_fn(|| job.dequeue_job_step())
            .map(|s| s.display_name())
            .collect();
        assert_eq!(names, vec!["Pre Run octo/node@v1", "Run make", "Run octo/node@v1"]);
        assert_eq!(job.post_job_step_count(), 1);
        assert!(job.workspace_directory().unwrap().ends_with("hello/hello"));
        assert_eq!(
            host.queue.last_record("Set up job").unwrap().result,
            Some(TaskResult::Succeeded)
        );
    }

    #[test]
    fn job_container_is_published_and_pulled() {
        let host = TestHost::new();
        let mut message = message(vec![script_step("build", "make")]);
        message.job_container = Some(JobContainerInfo {
            image: "docker://node:20".to_string(),
            environment: [("NODE_ENV".to_string(), "test".to_string())].into(),
        });
        let mut job = job_for(&host, &message);

        let result = JobExtension::new().initialize_job(&mut job, &message);
        if !CURRENT_PLATFORM.supports_containers() {
            assert!(result.is_err());
            return;
        }
        result.unwrap();

        let container = job.global().container_info.clone().unwrap();
        assert_eq!(container.image, "node:20");
        assert!(container.is_job_container);
        assert_eq!(container.environment["NODE_ENV"], "test");
        assert_eq!(job.dequeue_job_step().unwrap().display_name(), "Pull node:20");
    }

    #[test]
    fn failure_is_recorded_on_the_setup_step() {
        let host = TestHost::new();
        let mut message = message(vec![node_action("missing")]);
        message.context_data.clear();
        let mut job = host.job_context();

        let err = JobExtension::new().initialize_job(&mut job, &message).unwrap_err();
        assert!(err.to_string().contains("repository"));
        assert_eq!(job.job_step_count(), 0);
        let record = host.queue.last_record("Set up job").unwrap();
        assert_eq!(record.result, Some(TaskResult::Failed));
        assert_eq!(record.error_count, 1);
    }

    #[tokio::test]
    async fn finalize_removes_temp() {
        let host = TestHost::new();
        let temp = host.services.host.get_directory(WellKnownDirectory::Temp);
        std::fs::create_dir_all(&temp).unwrap();
        std::fs::write(temp.join("leftover.sh"), "").unwrap();

        let mut ctx = host.step_context("Complete job");
        JobFinalizeStep::new().run_async(&mut ctx).await.unwrap();
        assert!(!temp.exists());
    }
}
