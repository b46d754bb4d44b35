// WorkerServices: the collaborators a job run talks to, wired once per worker.
// `new` supplies the production implementations; the `with_*` builders swap
// individual pieces.

use runner_common::host_context::HostContext;
use runner_common::job_server_queue::{ConsoleJobServerQueue, JobServerQueue};
use runner_sdk::{ActionPlugin, TracingTraceWriter};
use std::collections::HashMap;
use std::sync::Arc;

use crate::action_command_manager::ActionCommandExtension;
use crate::action_manager::ActionManager;
use crate::command_extensions::default_extensions;
use crate::container::{ContainerRuntime, DockerContainerRuntime};
use crate::directory_manager::{DirectoryManager, PipelineDirectoryManager};
use crate::expressions::{BasicExpressionEvaluator, ExpressionEvaluator};
use crate::handlers::step_host::{DefaultStepHost, StepHost};

pub struct WorkerServices {
    pub host: Arc<HostContext>,
    pub job_server_queue: Arc<dyn JobServerQueue>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub directory_manager: Arc<dyn DirectoryManager>,
    pub container_runtime: Arc<dyn ContainerRuntime>,

    /// Runs processes on the host. Steps in a job container go through the
    /// container runtime instead.
    pub step_host: Arc<dyn StepHost>,

    pub action_manager: ActionManager,

    /// Each step's command manager is built from this set.
    pub command_extensions: Vec<Arc<dyn ActionCommandExtension>>,

    // Keyed by lowercase name.
    plugins: HashMap<String, Arc<dyn ActionPlugin>>,
}

impl WorkerServices {
    pub fn new(host: Arc<HostContext>) -> Self {
        Self {
            job_server_queue: Arc::new(ConsoleJobServerQueue),
            evaluator: Arc::new(BasicExpressionEvaluator),
            directory_manager: Arc::new(PipelineDirectoryManager::new(Arc::clone(&host))),
            container_runtime: Arc::new(DockerContainerRuntime::new()),
            step_host: Arc::new(DefaultStepHost::new(Arc::new(TracingTraceWriter))),
            action_manager: ActionManager::new(Arc::clone(&host)),
            command_extensions: default_extensions(),
            plugins: HashMap::new(),
            host,
        }
    }

    pub fn with_job_server_queue(mut self, queue: Arc<dyn JobServerQueue>) -> Self {
        self.job_server_queue = queue;
        self
    }

    pub fn with_container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = runtime;
        self
    }

    pub fn with_step_host(mut self, step_host: Arc<dyn StepHost>) -> Self {
        self.step_host = step_host;
        self
    }

    pub fn with_plugin(mut self, name: &str, plugin: Arc<dyn ActionPlugin>) -> Self {
        tracing::debug!(plugin = name, "Register action plugin");
        self.plugins.insert(name.to_lowercase(), plugin);
        self
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn ActionPlugin>> {
        self.plugins.get(&name.to_lowercase()).cloned()
    }
}
