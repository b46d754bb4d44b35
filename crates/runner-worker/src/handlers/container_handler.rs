// ContainerActionHandler: runs a container action's entry point through the
// container runtime, with the workspace mounted at /github/workspace.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use runner_common::constants::pipeline::DOCKER_PREFIX;
use runner_common::constants::{WellKnownDirectory, CURRENT_PLATFORM};
use tokio::sync::mpsc;

use crate::action_manifest_manager::ExecutionData;
use crate::container::{ContainerInfo, ContainerRunOptions};
use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{output_manager, pump_output, ActionRunStage, Handler, HandlerData};

const CONTAINER_WORKSPACE: &str = "/github/workspace";
const CONTAINER_RUNNER_TEMP: &str = "/github/runner_temp";

pub struct ContainerActionHandler;

#[async_trait]
impl Handler for ContainerActionHandler {
    async fn run_async(&self, context: &mut ExecutionContext, data: &HandlerData) -> Result<()> {
        let ExecutionData::Container(action) = &data.execution else {
            bail!("Container handler cannot run a '{}' action", data.execution.action_type());
        };
        if !CURRENT_PLATFORM.supports_containers() {
            bail!("Container action is only supported on Linux, not on {CURRENT_PLATFORM}");
        }

        let image = match &data.prepared_image {
            Some(image) => image.clone(),
            None => action
                .image
                .strip_prefix(DOCKER_PREFIX)
                .map(str::to_string)
                .with_context(|| format!("The image for action '{}' was not prepared", data.reference))?,
        };

        let entry_point = match data.stage {
            ActionRunStage::Pre => Some(
                action
                    .pre_entry_point
                    .clone()
                    .with_context(|| format!("Action '{}' has no pre-entrypoint", data.reference))?,
            ),
            ActionRunStage::Main => action.entry_point.clone(),
            ActionRunStage::Post => Some(
                action
                    .post_entry_point
                    .clone()
                    .with_context(|| format!("Action '{}' has no post-entrypoint", data.reference))?,
            ),
        };

        let mut arguments = Vec::with_capacity(action.arguments.len());
        for argument in &action.arguments {
            arguments.push(context.evaluate_template(argument)?);
        }

        let mut container = ContainerInfo::new(&image);
        let host = &context.services().host;
        let workspace = context
            .workspace_directory()
            .unwrap_or_else(|| host.work_directory().to_path_buf());
        container.add_path_mapping(&workspace, CONTAINER_WORKSPACE);
        container.add_path_mapping(host.get_directory(WellKnownDirectory::Temp), CONTAINER_RUNNER_TEMP);

        let mut environment = self.prepare_environment(context, data);
        for (key, value) in &action.environment {
            environment.insert(key.clone(), context.evaluate_template(value)?);
        }
        environment.insert("GITHUB_WORKSPACE".to_string(), CONTAINER_WORKSPACE.to_string());
        environment.remove("GITHUB_ACTION_PATH");

        let options = ContainerRunOptions {
            image,
            entry_point,
            arguments,
            environment,
            working_directory: Some(CONTAINER_WORKSPACE.to_string()),
            mounts: container.path_mappings.clone(),
        };
        context.debug(&format!("Running container action '{}' with image '{}'", data.reference, options.image));

        let runtime = std::sync::Arc::clone(&context.services().container_runtime);
        let mut output = output_manager(context, Some(container));
        let cancel = context.cancel_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let process = async move { runtime.run(&options, tx, cancel).await };
        let exit_code = pump_output(context, rx, process, |ctx, line| output.on_data_received(ctx, line)).await?;
        if exit_code != 0 {
            bail!("Docker run failed with exit code {exit_code}");
        }
        Ok(())
    }
}
