// CompositeActionHandler: runs the steps of a composite action in order,
// each in an embedded child context under the action's own steps scope,
// then evaluates the action's outputs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use runner_common::constants::COMPOSITE_ACTIONS_MAX_DEPTH;
use runner_common::util::task_result_util::{TaskResult, TaskResultUtil};
use std::sync::Arc;

use crate::action_manifest_manager::ExecutionData;
use crate::action_runner::ActionRunner;
use crate::execution_context::ExecutionContext;
use crate::expressions::ExecutionStatus;
use crate::handlers::handler::{ActionRunStage, Handler, HandlerData};

pub struct CompositeActionHandler;

#[async_trait]
impl Handler for CompositeActionHandler {
    async fn run_async(&self, context: &mut ExecutionContext, data: &HandlerData) -> Result<()> {
        let ExecutionData::Composite(composite) = &data.execution else {
            bail!("Composite handler cannot run a '{}' action", data.execution.action_type());
        };
        if data.stage != ActionRunStage::Main {
            bail!("Composite action '{}' has no {} stage", data.reference, data.stage);
        }
        if context.depth() >= COMPOSITE_ACTIONS_MAX_DEPTH {
            bail!("Composite action depth exceeded max depth {COMPOSITE_ACTIONS_MAX_DEPTH}");
        }

        let scope = child_scope(context);
        context.global_mut().steps_context.clear_scope(&scope);
        let inputs = serde_json::to_value(&data.inputs)?;
        let mut environment = context.step_environment.clone();
        environment.extend(data.environment.clone());

        for (index, step) in composite.steps.iter().enumerate() {
            let runner = ActionRunner::new(Arc::new(step.clone()), ActionRunStage::Main);
            let mut child =
                context.create_embedded_child(scope.as_str(), step.name.as_str(), index as u32 + 1, Some(step.id.clone()));
            child.step_environment = environment.clone();
            child.expression_overrides.insert("inputs".to_string(), inputs.clone());

            let status = ExecutionStatus::new(context.result(), child.cancel_token().is_cancelled());
            match child.evaluate_condition(step.condition.as_deref(), &status) {
                Ok(true) => {
                    if let Err(e) = runner.run_stage(&mut child).await {
                        if child.cancel_token().is_cancelled() {
                            child.set_result(TaskResult::Canceled);
                        } else {
                            child.error_chain(&e);
                            child.set_result(TaskResult::Failed);
                        }
                    }
                }
                Ok(false) => {
                    child.debug("Skipping step due to condition evaluation.");
                    child.complete(Some(TaskResult::Skipped));
                    continue;
                }
                Err(e) => {
                    child.error(&format!("Error evaluating 'if' of composite step: {e}"));
                    child.set_result(TaskResult::Failed);
                }
            }

            child.fold_command_result();
            child.apply_continue_on_error(step.continue_on_error.as_deref());
            let result = child.complete(None);
            context.set_result(TaskResultUtil::merge_task_results(context.result(), result));
        }

        for (name, template) in &composite.outputs {
            let mut evaluator = context.create_embedded_child(scope.as_str(), "", 0, None);
            evaluator.expression_overrides.insert("inputs".to_string(), inputs.clone());
            let value = evaluator.evaluate_template(template)?;
            context.set_output(name, &value);
        }
        Ok(())
    }
}

/// `steps` scope for the action's own steps: nested under the parent scope,
/// named after the step (or a generated name for unnamed steps).
fn child_scope(context: &ExecutionContext) -> String {
    let name = if context.context_name().is_empty() {
        format!("__{}", uuid::Uuid::new_v4().simple())
    } else {
        context.context_name().to_string()
    };
    if context.scope_name().is_empty() {
        name
    } else {
        format!("{}.{}", context.scope_name(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_manifest_manager::ActionManifestManager;
    use crate::test_support::{RecordingStepHost, TestHost};
    use runner_common::ActionResult;
    use std::collections::HashMap;

    const ACTION: &str = r#"
inputs:
  who:
    default: world
outputs:
  greeting:
    value: ${{ steps.hello.outputs.text }}
runs:
  using: composite
  steps:
    - id: hello
      run: echo hi ${{ inputs.who }}
      shell: bash
    - id: broken
      run: exit 1
      shell: bash
      continue-on-error: true
    - run: echo only on failure
      shell: bash
      if: failure()
"#;

    fn composite_data(inputs: &[(&str, &str)]) -> HandlerData {
        let definition = ActionManifestManager::parse(ACTION, "action.yml").unwrap();
        HandlerData {
            stage: ActionRunStage::Main,
            execution: definition.execution,
            inputs: inputs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            environment: HashMap::new(),
            action_directory: None,
            prepared_image: None,
            reference: "./greet".to_string(),
        }
    }

    #[tokio::test]
    async fn runs_steps_and_sets_outputs() {
        let step_host = Arc::new(RecordingStepHost::new(&["::set-output name=text::hi mona"], 0));
        let host = TestHost::with_step_host(step_host.clone());
        let mut ctx = host.step_context("greet");

        CompositeActionHandler
            .run_async(&mut ctx, &composite_data(&[("who", "mona")]))
            .await
            .unwrap();

        // Two steps ran; the failure() step was skipped.
        assert_eq!(step_host.invocation_count(), 2);
        assert_eq!(ctx.result(), Some(TaskResult::Succeeded));
        let global = ctx.global();
        assert_eq!(global.steps_context.get("greet", "hello").unwrap().outputs["text"], "hi mona");
        assert_eq!(global.steps_context.get("", "greet").unwrap().outputs["greeting"], "hi mona");
    }

    #[tokio::test]
    async fn failing_step_fails_the_action() {
        let step_host = Arc::new(RecordingStepHost::new(&[], 1));
        let host = TestHost::with_step_host(step_host.clone());
        let mut ctx = host.step_context("greet");

        CompositeActionHandler
            .run_async(&mut ctx, &composite_data(&[]))
            .await
            .unwrap();

        // hello fails, broken is skipped by success(), the failure() step runs.
        assert_eq!(step_host.invocation_count(), 2);
        assert_eq!(ctx.result(), Some(TaskResult::Failed));
        let global = ctx.global();
        let hello = global.steps_context.get("greet", "hello").unwrap();
        assert_eq!(hello.conclusion, Some(ActionResult::Failure));
        let broken = global.steps_context.get("greet", "broken").unwrap();
        assert_eq!(broken.conclusion, Some(ActionResult::Skipped));
        drop(global);
        assert!(ctx.record().error_count >= 1);
    }

    #[tokio::test]
    async fn depth_is_limited() {
        let host = TestHost::new();
        let mut ctx = host.step_context("greet");
        let mut nested = ctx.create_embedded_child("", "a", 1, None);
        for _ in 1..COMPOSITE_ACTIONS_MAX_DEPTH {
            nested = nested.create_embedded_child("", "a", 1, None);
        }
        let err = CompositeActionHandler
            .run_async(&mut nested, &composite_data(&[]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("max depth"));
    }
}
