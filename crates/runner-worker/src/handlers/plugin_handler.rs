// RunnerPluginHandler: runs an action implemented in-process by a
// registered `ActionPlugin`. Plugin trace output is processed like the
// output of a child process, with the plugin-only commands enabled.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use runner_sdk::{ActionPluginContext, ChannelTraceWriter};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::action_manifest_manager::ExecutionData;
use crate::execution_context::ExecutionContext;
use crate::expressions::to_display_string;
use crate::handlers::handler::{output_manager, pump_output, ActionRunStage, Handler, HandlerData};

pub struct RunnerPluginHandler;

#[async_trait]
impl Handler for RunnerPluginHandler {
    async fn run_async(&self, context: &mut ExecutionContext, data: &HandlerData) -> Result<()> {
        let ExecutionData::Plugin(plugin) = &data.execution else {
            bail!("Plugin handler cannot run a '{}' action", data.execution.action_type());
        };
        let name = match data.stage {
            ActionRunStage::Main => plugin.plugin.clone(),
            ActionRunStage::Post => plugin
                .post_plugin
                .clone()
                .with_context(|| format!("Action '{}' has no post plugin", data.reference))?,
            ActionRunStage::Pre => bail!("Plugin actions have no pre stage"),
        };
        let runner_plugin = context
            .services()
            .plugin(&name)
            .with_context(|| format!("Unknown plugin '{name}'"))?;

        let plugin_context = ActionPluginContext {
            inputs: data.inputs.clone(),
            variables: context.variables().public_values(),
            github: github_strings(context),
        };
        context.debug(&format!("Running plugin '{name}'"));

        let mut output = output_manager(context, None);
        output.command_manager_mut().enable_plugin_internal_command();
        let cancel = context.cancel_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let plugin_name = name.clone();
        let process = async move {
            let writer = ChannelTraceWriter::new(tx);
            let mut plugin_context = plugin_context;
            tokio::select! {
                result = runner_plugin.run(&mut plugin_context, &writer) => result.map(|()| 0),
                _ = cancel.cancelled() => Err(anyhow!("The plugin '{plugin_name}' was canceled.")),
            }
        };
        let result = pump_output(context, rx, process, |ctx, line| output.on_data_received(ctx, line)).await;
        output.command_manager_mut().disable_plugin_internal_command();
        result.map(|_| ())
    }
}

/// The scalar values of the `github` context as strings.
fn github_strings(context: &ExecutionContext) -> HashMap<String, String> {
    let global = context.global();
    let Some(Value::Object(github)) = global.context_data.get("github") else {
        return HashMap::new();
    };
    github
        .iter()
        .filter(|(_, v)| !v.is_object() && !v.is_array())
        .map(|(k, v)| (k.clone(), to_display_string(v)))
        .collect()
}
