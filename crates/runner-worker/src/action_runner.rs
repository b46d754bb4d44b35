// ActionRunner: one stage (pre, main or post) of one step, runnable by the
// steps runner or, for steps of a composite action, by the composite handler.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::action_manifest_manager::ActionDefinition;
use crate::execution_context::{ExecutionContext, IStep};
use crate::handlers::handler::{ActionRunStage, HandlerData, HandlerFactory};
use crate::worker::{ActionStep, ActionStepReference};

pub struct ActionRunner {
    id: String,
    stage: ActionRunStage,
    action: Arc<ActionStep>,
    condition: Option<String>,
}

impl ActionRunner {
    pub fn new(action: Arc<ActionStep>, stage: ActionRunStage) -> Self {
        let id = match stage {
            ActionRunStage::Pre => format!("{}_pre", action.id),
            ActionRunStage::Main => action.id.clone(),
            ActionRunStage::Post => format!("{}_post", action.id),
        };
        let condition = match stage {
            ActionRunStage::Main => action.condition.clone(),
            _ => None,
        };
        Self {
            id,
            stage,
            action,
            condition,
        }
    }

    /// Override the `if:` of a pre or post stage.
    pub fn with_condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn action(&self) -> &ActionStep {
        &self.action
    }

    pub async fn run_stage(&self, context: &mut ExecutionContext) -> Result<()> {
        let services = Arc::clone(context.services());
        let loaded = services.action_manager.load_action(context, &self.action)?;
        let definition = &loaded.definition;

        let mut environment = HashMap::new();
        for (key, value) in &self.action.environment {
            let value = context.evaluate_template(value)?;
            context.step_environment.insert(key.clone(), value.clone());
            environment.insert(key.clone(), value);
        }

        let inputs = self.evaluate_inputs(context, definition)?;
        context
            .expression_overrides
            .insert("inputs".to_string(), serde_json::to_value(&inputs)?);

        context.step_telemetry.action_type = definition.execution.action_type().to_string();
        context.step_telemetry.reference = Some(self.action.reference.describe());

        if self.stage == ActionRunStage::Main && definition.execution.has_post() {
            let post = ActionRunner::new(Arc::clone(&self.action), ActionRunStage::Post)
                .with_condition(definition.execution.post_condition());
            context.register_post_job_step(Arc::new(post));
        }

        let data = HandlerData {
            stage: self.stage,
            execution: definition.execution.clone(),
            inputs: inputs.into_iter().collect(),
            environment,
            action_directory: loaded.directory.clone(),
            prepared_image: services.action_manager.cached_image(&self.action.id),
            reference: self.action.reference.describe(),
        };
        HandlerFactory::create(&data.execution).run_async(context, &data).await
    }

    /// `with:` values evaluated in the step's context, then defaults for
    /// inputs the step did not set.
    fn evaluate_inputs(
        &self,
        context: &mut ExecutionContext,
        definition: &ActionDefinition,
    ) -> Result<BTreeMap<String, String>> {
        let mut inputs = BTreeMap::new();
        let mut unexpected = Vec::new();
        for (name, value) in &self.action.inputs {
            match definition.input(name) {
                Some(input) => {
                    if let Some(message) = &input.deprecation_message {
                        context.warning(&format!("Input '{name}' has been deprecated with message: {message}"));
                    }
                }
                None => unexpected.push(name.clone()),
            }
            inputs.insert(name.clone(), context.evaluate_template(value)?);
        }

        for input in &definition.inputs {
            if inputs.keys().any(|k| k.eq_ignore_ascii_case(&input.name)) {
                continue;
            }
            if let Some(default) = &input.default {
                inputs.insert(input.name.clone(), context.evaluate_template(default)?);
            }
        }

        let is_action = matches!(self.action.reference, ActionStepReference::Repository { .. });
        if is_action && !unexpected.is_empty() {
            unexpected.sort();
            let valid: Vec<_> = definition.inputs.iter().map(|i| format!("'{}'", i.name)).collect();
            context.warning(&format!(
                "Unexpected input(s) '{}', valid inputs are [{}]",
                unexpected.join("', '"),
                valid.join(", ")
            ));
        }
        Ok(inputs)
    }
}

impl IStep for ActionRunner {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> String {
        let name = if self.action.display_name.is_empty() {
            match &self.action.reference {
                ActionStepReference::Script { script, .. } => {
                    format!("Run {}", script.lines().next().unwrap_or_default())
                }
                reference => format!("Run {}", reference.describe()),
            }
        } else {
            self.action.display_name.clone()
        };
        match self.stage {
            ActionRunStage::Main => name,
            stage => format!("{stage} {name}"),
        }
    }

    fn context_name(&self) -> &str {
        match self.stage {
            ActionRunStage::Main => &self.action.name,
            _ => "",
        }
    }

    fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    fn continue_on_error(&self) -> Option<&str> {
        match self.stage {
            ActionRunStage::Main => self.action.continue_on_error.as_deref(),
            _ => None,
        }
    }

    fn timeout_in_minutes(&self) -> Option<u32> {
        match self.stage {
            ActionRunStage::Main => self.action.timeout_in_minutes,
            _ => None,
        }
    }

    fn action_id(&self) -> Option<&str> {
        Some(&self.action.id)
    }

    fn run_async<'a>(
        &'a self,
        context: &'a mut ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.run_stage(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{script_step, TestHost};

    fn action_step(dir_name: &str) -> ActionStep {
        ActionStep {
            reference: ActionStepReference::Repository {
                name: "octo/hello".to_string(),
                git_ref: "v1".to_string(),
                path: Some(dir_name.to_string()),
            },
            ..script_step("hello", "unused")
        }
    }

    #[test]
    fn names_and_ids_per_stage() {
        let step = Arc::new(script_step("build", "make all\nmake check"));
        let main = ActionRunner::new(Arc::clone(&step), ActionRunStage::Main);
        let post = ActionRunner::new(Arc::clone(&step), ActionRunStage::Post).with_condition("always()");

        assert_eq!(main.id(), "build-id");
        assert_eq!(post.id(), "build-id_post");
        assert_eq!(main.display_name(), "Run make all");
        assert_eq!(post.display_name(), "Post Run make all");
        assert_eq!(main.context_name(), "build");
        assert_eq!(post.context_name(), "");
        assert_eq!(post.condition(), Some("always()"));
        assert_eq!(post.action_id(), main.action_id());
    }

    #[tokio::test]
    async fn inputs_defaults_and_warnings() {
        let actions = tempfile::tempdir().unwrap();
        let dir = actions.path().join("octo/hello/v1/greet");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("action.yml"),
            "inputs:\n  who:\n    default: ${{ github.actor }}\n  old:\n    deprecationMessage: gone\nruns:\n  plugin: greeter\n",
        )
        .unwrap();

        let host = TestHost::with_actions_directory(actions.path());
        let mut ctx = host.step_context("hello");
        ctx.global_mut().set_github_value("actor", "mona");

        let mut step = action_step("greet");
        step.inputs.insert("old".to_string(), "x".to_string());
        step.inputs.insert("extra".to_string(), "y".to_string());
        let runner = ActionRunner::new(Arc::new(step), ActionRunStage::Main);
        let loaded = host.services.action_manager.load_action(&mut ctx, runner.action()).unwrap();
        let inputs = runner.evaluate_inputs(&mut ctx, &loaded.definition).unwrap();

        assert_eq!(inputs["who"], "mona");
        assert_eq!(inputs["old"], "x");
        let warnings: Vec<_> = ctx.record().issues.iter().map(|i| i.message.clone()).collect();
        assert_eq!(
            warnings,
            vec![
                "Input 'old' has been deprecated with message: gone".to_string(),
                "Unexpected input(s) 'extra', valid inputs are ['who', 'old']".to_string(),
            ]
        );
    }
}
