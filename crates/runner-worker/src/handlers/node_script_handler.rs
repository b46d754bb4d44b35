// NodeScriptActionHandler: runs the `main`, `pre` or `post` script of a
// JavaScript action with `node`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::action_manifest_manager::ExecutionData;
use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{run_process, step_host_for, ActionRunStage, Handler, HandlerData};

pub struct NodeScriptActionHandler;

#[async_trait]
impl Handler for NodeScriptActionHandler {
    async fn run_async(&self, context: &mut ExecutionContext, data: &HandlerData) -> Result<()> {
        let ExecutionData::NodeJs(node) = &data.execution else {
            bail!("Node handler cannot run a '{}' action", data.execution.action_type());
        };
        let target = match data.stage {
            ActionRunStage::Pre => node.pre.as_deref(),
            ActionRunStage::Main => Some(node.script.as_str()),
            ActionRunStage::Post => node.post.as_deref(),
        }
        .with_context(|| format!("Action '{}' has no {} script", data.reference, data.stage))?;

        let action_directory = data
            .action_directory
            .as_deref()
            .with_context(|| format!("Action '{}' has no directory", data.reference))?;
        let script = action_directory.join(target);
        if !script.is_file() {
            bail!("File not found: '{}'", script.display());
        }

        let environment = self.prepare_environment(context, data);
        let working_directory = context
            .workspace_directory()
            .unwrap_or_else(|| action_directory.to_path_buf());
        let (host, container) = step_host_for(context);
        let arguments = vec![host.resolve_path(&script)];
        context.debug(&format!("Running {} with node ({})", script.display(), node.node_version));

        run_process(
            context,
            host,
            container,
            working_directory,
            "node".to_string(),
            arguments,
            environment,
        )
        .await
    }
}
