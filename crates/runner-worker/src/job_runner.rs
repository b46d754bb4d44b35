// JobRunner: runs one job message to completion.
// Builds the job context, initializes the job, runs its steps and returns
// the job result.

use anyhow::Result;
use runner_common::constants::{WellKnownDirectory, CURRENT_PLATFORM};
use runner_common::util::task_result_util::TaskResult;
use runner_sdk::TraceWriter;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::execution_context::{ExecutionContext, Global};
use crate::job_extension::JobExtension;
use crate::steps_runner::StepsRunner;
use crate::services::WorkerServices;
use crate::variables::Variables;
use crate::worker::AgentJobRequestMessage;

pub struct JobRunner {
    services: Arc<WorkerServices>,
}

impl JobRunner {
    pub fn new(services: Arc<WorkerServices>) -> Self {
        Self { services }
    }

    /// Run the job. Cancelling `cancel_token` cancels the running step;
    /// steps that allow it (`always()`, `cancelled()`) still run.
    pub async fn run_async(&self, message: AgentJobRequestMessage, cancel_token: CancellationToken) -> Result<TaskResult> {
        let host = &self.services.host;
        let trace = host.get_trace("JobRunner");
        trace.info(&format!("Starting job: {} ({})", message.job_display_name, message.job_id));

        let variables = Variables::from_message(&message.variables, host.secret_masker());
        let mut global = Global::new(&message.job_id, &message.job_display_name, variables);
        global.environment_variables = message.environment_variables.clone();
        global.context_data = message.context_data.clone();
        global
            .context_data
            .insert("runner".to_string(), self.runner_context(global.write_debug));

        let mut job = ExecutionContext::new_job(Arc::clone(&self.services), global, cancel_token);
        job.start();

        if let Err(e) = JobExtension::new().initialize_job(&mut job, &message) {
            trace.error_chain(&e);
            let result = job.complete(Some(TaskResult::Failed));
            trace.info(&format!("Job initialization failed, job result: {result}"));
            return Ok(result);
        }

        StepsRunner::new().run_async(&mut job).await?;

        let result = job.complete(None);
        trace.info(&format!("Job completed with result: {result}"));
        Ok(result)
    }

    /// The `runner` expression context.
    fn runner_context(&self, debug: bool) -> serde_json::Value {
        let host = &self.services.host;
        let arch = match std::env::consts::ARCH {
            "x86_64" => "X64",
            "x86" => "X86",
            "aarch64" => "ARM64",
            "arm" => "ARM",
            other => other,
        };
        json!({
            "os": CURRENT_PLATFORM.to_string(),
            "arch": arch,
            "name": std::env::var("RUNNER_NAME").unwrap_or_else(|_| "Hosted Agent".to_string()),
            "temp": host.get_directory(WellKnownDirectory::Temp).display().to_string(),
            "tool_cache": host.get_directory(WellKnownDirectory::Tools).display().to_string(),
            "debug": if debug { "1" } else { "" },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{script_step, RecordingStepHost, TestHost};
    use crate::worker::VariableValueMessage;
    use runner_common::util::task_result_util::TaskResultUtil;

    fn message() -> AgentJobRequestMessage {
        let mut message = AgentJobRequestMessage {
            job_id: "job-1".to_string(),
            job_display_name: "Build".to_string(),
            ..AgentJobRequestMessage::default()
        };
        message
            .context_data
            .insert("github".to_string(), json!({"repository": "octo/hello"}));
        message.variables.insert(
            "token".to_string(),
            VariableValueMessage {
                value: "hunter2".to_string(),
                is_secret: true,
            },
        );
        message
    }

    #[tokio::test]
    async fn runs_steps_and_masks_secrets() {
        let step_host = Arc::new(RecordingStepHost::new(&["token is hunter2"], 0));
        let host = TestHost::with_step_host(step_host.clone());
        let mut message = message();
        message.steps = vec![script_step("one", "echo one"), script_step("two", "echo ${{ runner.os }}")];

        let result = JobRunner::new(Arc::clone(&host.services))
            .run_async(message, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, TaskResult::Succeeded);
        assert_eq!(step_host.invocation_count(), 2);
        let expected = format!("echo {CURRENT_PLATFORM}");
        assert_eq!(step_host.last_invocation().unwrap().script, Some(expected));
        let lines = host.queue.lines();
        assert!(lines.contains(&"token is ***".to_string()));
        assert!(!lines.iter().any(|l| l.contains("hunter2")));
        assert_eq!(host.queue.last_record("Build").unwrap().result, Some(TaskResult::Succeeded));
    }

    #[tokio::test]
    async fn failed_initialization_fails_the_job() {
        let step_host = Arc::new(RecordingStepHost::new(&[], 0));
        let host = TestHost::with_step_host(step_host.clone());
        let mut message = message();
        message.context_data.clear();
        message.steps = vec![script_step("one", "echo one")];

        let result = JobRunner::new(Arc::clone(&host.services))
            .run_async(message, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, TaskResult::Failed);
        assert_eq!(step_host.invocation_count(), 0);
    }

    #[tokio::test]
    async fn failing_step_fails_the_job() {
        let host = TestHost::with_step_host(Arc::new(RecordingStepHost::new(&[], 2)));
        let mut message = message();
        message.steps = vec![script_step("one", "exit 2")];

        let result = JobRunner::new(Arc::clone(&host.services))
            .run_async(message, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, TaskResult::Failed);
        assert_eq!(TaskResultUtil::translate_to_return_code(result), 102);
    }
}
