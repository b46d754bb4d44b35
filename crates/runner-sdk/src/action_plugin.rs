use crate::string_util::StringUtil;
use crate::trace::TraceWriter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Inputs and job state handed to an in-process action plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionPluginContext {
    /// Evaluated step inputs.
    pub inputs: HashMap<String, String>,

    /// Job variables visible to the plugin (secrets already excluded).
    pub variables: HashMap<String, String>,

    /// The `github` context flattened to strings.
    #[serde(default)]
    pub github: HashMap<String, String>,
}

impl ActionPluginContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an input value by name (case-insensitive).
    ///
    /// If `required` is true and the input is missing or empty, returns an error.
    pub fn get_input(&self, name: &str, required: bool) -> anyhow::Result<Option<String>> {
        let value = self
            .inputs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone());

        if required && value.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("Input required and not supplied: {name}");
        }

        Ok(value)
    }

    /// Get a variable value by name (case-insensitive).
    pub fn get_variable(&self, name: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether step debug logging is on.
    pub fn is_debug(&self) -> bool {
        self.get_variable("ACTIONS_STEP_DEBUG")
            .and_then(StringUtil::convert_to_bool)
            .unwrap_or(false)
    }
}

/// An action implemented inside the runner instead of a child process.
///
/// Plugins report through the trace writer; lines written there are processed
/// like any other step output, so plugins may emit workflow commands.
#[async_trait]
pub trait ActionPlugin: Send + Sync {
    async fn run(
        &self,
        context: &mut ActionPluginContext,
        trace: &dyn TraceWriter,
    ) -> anyhow::Result<()>;
}
