// Handler trait and HandlerFactory.
// One handler per execution variant; the factory matches exhaustively on the
// variant, and every handler feeds process output through the output manager.

use anyhow::Result;
use async_trait::async_trait;
use runner_sdk::path_util::PATH_VARIABLE;
use runner_sdk::PathUtil;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::action_command_manager::ActionCommandManager;
use crate::action_manifest_manager::ExecutionData;
use crate::container::ContainerInfo;
use crate::execution_context::ExecutionContext;
use crate::handlers::output_manager::OutputManager;
use crate::handlers::step_host::{ContainerStepHost, StepHost};

/// Which part of an action is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionRunStage {
    Pre,
    Main,
    Post,
}

impl std::fmt::Display for ActionRunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ActionRunStage::Pre => "Pre",
            ActionRunStage::Main => "Main",
            ActionRunStage::Post => "Post",
        })
    }
}

/// Everything a handler needs to run one stage of one action.
#[derive(Debug, Clone)]
pub struct HandlerData {
    pub stage: ActionRunStage,
    pub execution: ExecutionData,

    /// Evaluated `with:` values, defaults applied.
    pub inputs: HashMap<String, String>,

    /// Evaluated step `env:`.
    pub environment: HashMap<String, String>,

    /// Root of the action's files. `None` for scripts and plugins.
    pub action_directory: Option<PathBuf>,

    /// For container actions: the image prepared for this step.
    pub prepared_image: Option<String>,

    /// Human-readable reference, e.g. `actions/checkout@v4`.
    pub reference: String,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn run_async(&self, context: &mut ExecutionContext, data: &HandlerData) -> Result<()>;

    /// The process environment: step env, handler env, `INPUT_*` for every
    /// input, `STATE_*` saved by earlier stages, the well-known `GITHUB_*`
    /// values, and PATH with `add-path` entries in front.
    fn prepare_environment(&self, context: &ExecutionContext, data: &HandlerData) -> HashMap<String, String> {
        let mut env = context.step_environment.clone();
        env.extend(data.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (key, value) in &data.inputs {
            env.insert(format!("INPUT_{}", key.replace(' ', "_").to_uppercase()), value.clone());
        }
        for (key, value) in context.intra_action_state() {
            env.insert(format!("STATE_{key}"), value);
        }

        env.insert("CI".to_string(), "true".to_string());
        env.insert("GITHUB_ACTIONS".to_string(), "true".to_string());
        if let Some(workspace) = context.workspace_directory() {
            env.insert("GITHUB_WORKSPACE".to_string(), workspace.display().to_string());
        }
        if let Some(repository) = context.global().github_value("repository") {
            env.insert("GITHUB_REPOSITORY".to_string(), repository);
        }
        if let Some(directory) = &data.action_directory {
            env.insert("GITHUB_ACTION_PATH".to_string(), directory.display().to_string());
        }

        let prepend = context.global().prepend_path.clone();
        if !prepend.is_empty() {
            let current = env
                .get(PATH_VARIABLE)
                .cloned()
                .or_else(|| std::env::var(PATH_VARIABLE).ok())
                .unwrap_or_default();
            env.insert(PATH_VARIABLE.to_string(), PathUtil::build_path(&prepend, &current));
        }
        env
    }
}

pub struct HandlerFactory;

impl HandlerFactory {
    pub fn create(execution: &ExecutionData) -> Box<dyn Handler> {
        match execution {
            ExecutionData::Script(_) => Box::new(super::script_handler::ScriptHandler),
            ExecutionData::NodeJs(_) => Box::new(super::node_script_handler::NodeScriptActionHandler),
            ExecutionData::Container(_) => Box::new(super::container_handler::ContainerActionHandler),
            ExecutionData::Composite(_) => Box::new(super::composite_handler::CompositeActionHandler),
            ExecutionData::Plugin(_) => Box::new(super::plugin_handler::RunnerPluginHandler),
        }
    }
}

/// The step host for processes of this step: the job container when there
/// is one, else the host.
pub(crate) fn step_host_for(context: &ExecutionContext) -> (Arc<dyn StepHost>, Option<ContainerInfo>) {
    let container = context.global().container_info.clone();
    match container {
        Some(info) => (
            Arc::new(ContainerStepHost::new(
                Arc::clone(&context.services().container_runtime),
                info.clone(),
            )),
            Some(info),
        ),
        None => (Arc::clone(&context.services().step_host), None),
    }
}

/// A fresh output manager for one step's output stream.
pub(crate) fn output_manager(context: &mut ExecutionContext, container: Option<ContainerInfo>) -> OutputManager {
    let commands = ActionCommandManager::new(&context.services().command_extensions);
    OutputManager::new(context, commands, container)
}

/// Drive `process` to completion while handing every line it sends on the
/// channel to `on_line`. Lines still buffered when the process exits are
/// drained first.
pub(crate) async fn pump_output<F, L>(
    context: &mut ExecutionContext,
    mut lines: mpsc::UnboundedReceiver<String>,
    process: F,
    mut on_line: L,
) -> Result<i32>
where
    F: Future<Output = Result<i32>>,
    L: FnMut(&mut ExecutionContext, &str) -> Result<()>,
{
    tokio::pin!(process);
    let mut exit = None;
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => on_line(context, &line)?,
                None => break,
            },
            result = &mut process, if exit.is_none() => exit = Some(result),
        }
    }
    match exit {
        Some(result) => result,
        None => process.await,
    }
}

/// Run one process through `host`, routing its output through a fresh
/// output manager. A non-zero exit code fails the step.
pub(crate) async fn run_process(
    context: &mut ExecutionContext,
    host: Arc<dyn StepHost>,
    container: Option<ContainerInfo>,
    working_directory: PathBuf,
    file_name: String,
    arguments: Vec<String>,
    environment: HashMap<String, String>,
) -> Result<()> {
    let mut output = output_manager(context, container);
    let cancel = context.cancel_token();
    let (tx, rx) = mpsc::unbounded_channel();

    let process = async move {
        host.execute_async(&working_directory, &file_name, &arguments, &environment, tx, cancel)
            .await
    };
    let exit_code = pump_output(context, rx, process, |ctx, line| output.on_data_received(ctx, line)).await?;
    if exit_code != 0 {
        anyhow::bail!("Process completed with exit code {exit_code}.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_manifest_manager::{PluginExecution, ScriptExecution};
    use crate::test_support::TestHost;

    #[test]
    fn environment_has_inputs_and_path() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        ctx.step_environment.insert("FROM_STEP".to_string(), "1".to_string());
        ctx.step_environment.insert(PATH_VARIABLE.to_string(), "/usr/bin".to_string());
        ctx.global_mut().prepend_path.push("/tools".to_string());

        let mut inputs = HashMap::new();
        inputs.insert("node version".to_string(), "20".to_string());
        let data = HandlerData {
            stage: ActionRunStage::Main,
            execution: ExecutionData::Plugin(PluginExecution {
                plugin: "x".to_string(),
                post_plugin: None,
            }),
            inputs,
            environment: HashMap::new(),
            action_directory: Some(PathBuf::from("/actions/x")),
            prepared_image: None,
            reference: "x".to_string(),
        };

        let env = super::super::plugin_handler::RunnerPluginHandler.prepare_environment(&ctx, &data);
        assert_eq!(env["FROM_STEP"], "1");
        assert_eq!(env["INPUT_NODE_VERSION"], "20");
        assert_eq!(env["GITHUB_ACTION_PATH"], "/actions/x");
        assert_eq!(env["CI"], "true");
        let sep = PathUtil::path_separator();
        assert_eq!(env[PATH_VARIABLE], format!("/tools{sep}/usr/bin"));
    }

    #[tokio::test]
    async fn pump_drains_lines_sent_before_exit() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        let (tx, rx) = mpsc::unbounded_channel();
        let process = async move {
            for i in 0..3 {
                tx.send(format!("line {i}")).unwrap();
            }
            Ok(7)
        };

        let code = pump_output(&mut ctx, rx, process, |ctx, line| {
            ctx.output(line);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(code, 7);
        assert_eq!(ctx.log_lines(), vec!["line 0", "line 1", "line 2"]);
    }

    #[test]
    fn factory_is_exhaustive() {
        let script = ExecutionData::Script(ScriptExecution {
            script: "echo".to_string(),
            shell: None,
            working_directory: None,
        });
        let _ = HandlerFactory::create(&script);
    }
}
