// StepsContext: outcomes, conclusions and outputs of finished steps, exposed
// to expressions as `steps.<id>.outcome|conclusion|outputs.<name>`.
//
// Results are grouped by scope. Top-level steps live in the unnamed scope;
// steps of a composite action live in the scope of that action.

use runner_common::ActionResult;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StepResult {
    /// Before `continue-on-error` adjustment.
    pub outcome: Option<ActionResult>,

    /// After `continue-on-error` adjustment.
    pub conclusion: Option<ActionResult>,

    pub outputs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct StepsContext {
    scopes: HashMap<String, HashMap<String, StepResult>>,
}

impl StepsContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn step_mut(&mut self, scope_name: &str, step_name: &str) -> &mut StepResult {
        self.scopes
            .entry(scope_name.to_string())
            .or_default()
            .entry(step_name.to_string())
            .or_default()
    }

    pub fn set_outcome(&mut self, scope_name: &str, step_name: &str, outcome: ActionResult) {
        self.step_mut(scope_name, step_name).outcome = Some(outcome);
    }

    pub fn set_conclusion(&mut self, scope_name: &str, step_name: &str, conclusion: ActionResult) {
        self.step_mut(scope_name, step_name).conclusion = Some(conclusion);
    }

    /// Record an output and return the expression that reads it back.
    pub fn set_output(
        &mut self,
        scope_name: &str,
        step_name: &str,
        output_name: &str,
        value: impl Into<String>,
    ) -> String {
        self.step_mut(scope_name, step_name)
            .outputs
            .insert(output_name.to_string(), value.into());
        if scope_name.is_empty() {
            format!("steps['{step_name}']['outputs']['{output_name}']")
        } else {
            format!("steps['{scope_name}']['{step_name}']['outputs']['{output_name}']")
        }
    }

    pub fn get(&self, scope_name: &str, step_name: &str) -> Option<&StepResult> {
        self.scopes.get(scope_name)?.get(step_name)
    }

    /// Forget a composite action's steps once it finishes.
    pub fn clear_scope(&mut self, scope_name: &str) {
        self.scopes.remove(scope_name);
    }

    /// The `steps` expression value as seen from `scope_name`.
    pub fn to_value(&self, scope_name: &str) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (id, result) in self.scopes.get(scope_name).into_iter().flatten() {
            map.insert(
                id.clone(),
                serde_json::json!({
                    "outcome": result.outcome.map(|o| o.as_str()),
                    "conclusion": result.conclusion.map(|c| c.as_str()),
                    "outputs": result.outputs,
                }),
            );
        }
        serde_json::Value::Object(map)
    }
}
