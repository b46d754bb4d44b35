// Test doubles shared by the unit tests: a wired `WorkerServices` over a
// temp work directory, a step host and a container runtime that record what
// they were asked to do.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use runner_common::host_context::HostContext;
use runner_common::job_server_queue::MemoryJobServerQueue;
use runner_sdk::ProcessCanceledError;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::container::{ContainerRunOptions, ContainerRuntime};
use crate::execution_context::{ExecutionContext, Global};
use crate::handlers::step_host::StepHost;
use crate::services::WorkerServices;
use crate::variables::Variables;
use crate::worker::{ActionStep, ActionStepReference};

pub(crate) struct TestHost {
    pub services: Arc<WorkerServices>,
    pub queue: Arc<MemoryJobServerQueue>,
    pub variables: Variables,
    _work: Option<TempDir>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::build(None, None, |services| services)
    }

    pub fn with_work_directory(work: &Path) -> Self {
        Self::build(Some(work), None, |services| services)
    }

    pub fn with_actions_directory(actions: &Path) -> Self {
        Self::build(None, Some(actions), |services| services)
    }

    pub fn with_step_host(step_host: Arc<dyn StepHost>) -> Self {
        Self::with_services(|services| services.with_step_host(step_host))
    }

    pub fn with_runtime(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_services(|services| services.with_container_runtime(runtime))
    }

    pub fn with_actions_and_services(
        actions: &Path,
        configure: impl FnOnce(WorkerServices) -> WorkerServices,
    ) -> Self {
        Self::build(None, Some(actions), configure)
    }

    pub fn with_services(configure: impl FnOnce(WorkerServices) -> WorkerServices) -> Self {
        Self::build(None, None, configure)
    }

    fn build(
        work: Option<&Path>,
        actions: Option<&Path>,
        configure: impl FnOnce(WorkerServices) -> WorkerServices,
    ) -> Self {
        let temp = work.is_none().then(|| tempfile::tempdir().unwrap());
        let work_directory = match work {
            Some(work) => work.to_path_buf(),
            None => temp.as_ref().unwrap().path().to_path_buf(),
        };
        let host = match actions {
            Some(actions) => HostContext::with_actions_directory(work_directory, actions),
            None => HostContext::new(work_directory),
        };

        let queue = Arc::new(MemoryJobServerQueue::new());
        let services = configure(WorkerServices::new(Arc::clone(&host)).with_job_server_queue(queue.clone()));
        Self {
            variables: Variables::with_masker(host.secret_masker().clone()),
            services: Arc::new(services),
            queue,
            _work: temp,
        }
    }

    pub fn job_context(&self) -> ExecutionContext {
        let global = Global::new("job", "Job", self.variables.clone());
        ExecutionContext::new_job(Arc::clone(&self.services), global, CancellationToken::new())
    }

    /// A step context named `name` (both display and `steps.<name>`).
    pub fn step_context(&self, name: &str) -> ExecutionContext {
        self.job_context().create_child(name, "", name, None)
    }
}

/// A `run:` step whose id is `<name>-id`.
pub(crate) fn script_step(name: &str, script: &str) -> ActionStep {
    ActionStep {
        id: format!("{name}-id"),
        name: name.to_string(),
        display_name: String::new(),
        condition: None,
        continue_on_error: None,
        timeout_in_minutes: None,
        environment: HashMap::new(),
        inputs: HashMap::new(),
        reference: ActionStepReference::Script {
            script: script.to_string(),
            shell: None,
            working_directory: None,
        },
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub working_directory: PathBuf,
    pub file_name: String,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    /// Contents of the file named by the last argument, read at launch.
    pub script: Option<String>,
}

/// Prints fixed lines and exits with a fixed code. A hanging host waits
/// for cancellation instead.
pub(crate) struct RecordingStepHost {
    lines: Vec<String>,
    exit_code: i32,
    hang: bool,
    invocations: Mutex<Vec<Invocation>>,
}

impl RecordingStepHost {
    pub fn new(lines: &[&str], exit_code: i32) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            exit_code,
            hang: false,
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new(&[], 0)
        }
    }

    pub fn last_invocation(&self) -> Option<Invocation> {
        self.invocations.lock().last().cloned()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }
}

#[async_trait]
impl StepHost for RecordingStepHost {
    async fn execute_async(
        &self,
        working_directory: &Path,
        file_name: &str,
        arguments: &[String],
        environment: &HashMap<String, String>,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        self.invocations.lock().push(Invocation {
            working_directory: working_directory.to_path_buf(),
            file_name: file_name.to_string(),
            arguments: arguments.to_vec(),
            environment: environment.clone(),
            script: arguments.last().and_then(|a| std::fs::read_to_string(a).ok()),
        });
        for line in &self.lines {
            let _ = output.send(line.clone());
        }
        if self.hang {
            cancel.cancelled().await;
        }
        if cancel.is_cancelled() {
            return Err(ProcessCanceledError {
                file_name: file_name.to_string(),
            }
            .into());
        }
        Ok(self.exit_code)
    }
}

/// Records every call. Exit codes are taken from a queue, then default to 0.
#[derive(Default)]
pub(crate) struct RecordingRuntime {
    output: Vec<String>,
    exit_codes: Mutex<VecDeque<i32>>,
    calls: Mutex<Vec<String>>,
    runs: Mutex<Vec<ContainerRunOptions>>,
}

impl RecordingRuntime {
    pub fn with_output(lines: &[&str]) -> Self {
        Self {
            output: lines.iter().map(|l| l.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_exit_codes(codes: &[i32]) -> Self {
        Self {
            exit_codes: Mutex::new(codes.iter().copied().collect()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn runs(&self) -> Vec<ContainerRunOptions> {
        self.runs.lock().clone()
    }

    fn respond(&self, call: String, output: &mpsc::UnboundedSender<String>) -> i32 {
        self.calls.lock().push(call);
        for line in &self.output {
            let _ = output.send(line.clone());
        }
        self.exit_codes.lock().pop_front().unwrap_or(0)
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn pull(&self, image: &str, output: mpsc::UnboundedSender<String>, _cancel: CancellationToken) -> Result<i32> {
        Ok(self.respond(format!("pull {image}"), &output))
    }

    async fn build(
        &self,
        context: &Path,
        dockerfile: &Path,
        tag: &str,
        output: mpsc::UnboundedSender<String>,
        _cancel: CancellationToken,
    ) -> Result<i32> {
        Ok(self.respond(
            format!("build {} {} {tag}", context.display(), dockerfile.display()),
            &output,
        ))
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        output: mpsc::UnboundedSender<String>,
        _cancel: CancellationToken,
    ) -> Result<i32> {
        Ok(self.respond(format!("exec {container_id} {}", command.join(" ")), &output))
    }

    async fn run(
        &self,
        options: &ContainerRunOptions,
        output: mpsc::UnboundedSender<String>,
        _cancel: CancellationToken,
    ) -> Result<i32> {
        self.runs.lock().push(options.clone());
        Ok(self.respond(format!("run {}", options.image), &output))
    }
}
