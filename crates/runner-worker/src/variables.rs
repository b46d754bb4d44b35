// Variables: the job's variable store.
// Case-insensitive names, secret values registered with the masker as they
// arrive, and typed accessors for the knobs the worker reads.

use parking_lot::RwLock;
use runner_common::constants::variables::actions;
use runner_common::secret_masker::SecretMasker;
use runner_sdk::StringUtil;
use std::collections::HashMap;
use std::sync::Arc;

use crate::worker::VariableValueMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableValue {
    pub value: String,
    pub is_secret: bool,
}

/// Shared handle; clones see the same store.
#[derive(Clone, Default)]
pub struct Variables {
    // Keyed by lowercase name.
    store: Arc<RwLock<HashMap<String, VariableValue>>>,
    secret_masker: Option<SecretMasker>,
}

impl std::fmt::Debug for Variables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variables")
            .field("count", &self.store.read().len())
            .finish()
    }
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_masker(masker: SecretMasker) -> Self {
        Self {
            store: Arc::default(),
            secret_masker: Some(masker),
        }
    }

    /// Build the store from the job message, registering every secret.
    pub fn from_message(variables: &HashMap<String, VariableValueMessage>, masker: &SecretMasker) -> Self {
        let vars = Self::with_masker(masker.clone());
        for (name, var) in variables {
            vars.set(name, var.value.clone(), var.is_secret);
        }
        vars
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.store.read().get(&name.to_lowercase()).map(|v| v.value.clone())
    }

    /// `None` when the variable is missing or not a recognizable boolean.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).as_deref().and_then(StringUtil::convert_to_bool)
    }

    /// Variable first, then the process environment.
    pub fn get_or_env(&self, name: &str) -> Option<String> {
        self.get(name).or_else(|| std::env::var(name).ok())
    }

    pub fn set(&self, name: &str, value: impl Into<String>, is_secret: bool) {
        let value = value.into();
        if is_secret && !value.is_empty() {
            if let Some(masker) = &self.secret_masker {
                masker.add_value(&value);
            }
        }
        self.store
            .write()
            .insert(name.to_lowercase(), VariableValue { value, is_secret });
    }

    pub fn remove(&self, name: &str) {
        self.store.write().remove(&name.to_lowercase());
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.store.read().contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    pub fn step_debug(&self) -> bool {
        self.get_bool(actions::STEP_DEBUG).unwrap_or(false)
    }

    pub fn allow_unsecure_commands(&self) -> bool {
        self.get_or_env(actions::ALLOW_UNSUPPORTED_COMMANDS)
            .as_deref()
            .and_then(StringUtil::convert_to_bool)
            .unwrap_or(false)
    }

    pub fn allow_unsecure_stop_command_tokens(&self) -> bool {
        self.get_or_env(actions::ALLOW_UNSECURE_STOP_COMMAND_TOKENS)
            .as_deref()
            .and_then(StringUtil::convert_to_bool)
            .unwrap_or(false)
    }

    /// Non-secret variables, for handing to in-process plugins.
    pub fn public_values(&self) -> HashMap<String, String> {
        self.store
            .read()
            .iter()
            .filter(|(_, v)| !v.is_secret)
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive() {
        let vars = Variables::new();
        vars.set("FooBar", "value1", false);
        assert_eq!(vars.get("foobar"), Some("value1".to_string()));
        assert_eq!(vars.get("FOOBAR"), Some("value1".to_string()));
        assert!(vars.contains_key("fooBAR"));
        vars.remove("FOOBAR");
        assert!(vars.is_empty());
    }

    #[test]
    fn secrets_reach_the_masker() {
        let masker = SecretMasker::new();
        let vars = Variables::with_masker(masker.clone());
        vars.set("SECRET_KEY", "my-api-key", true);
        vars.set("PLAIN", "visible", false);
        assert_eq!(masker.mask_secrets("token is my-api-key"), "token is ***");
        assert_eq!(masker.mask_secrets("visible"), "visible");
        assert!(!vars.public_values().contains_key("secret_key"));
    }

    #[test]
    fn from_message_registers_secrets() {
        let masker = SecretMasker::new();
        let mut message = HashMap::new();
        message.insert(
            "MY_SECRET".to_string(),
            VariableValueMessage {
                value: "password123".to_string(),
                is_secret: true,
            },
        );
        let vars = Variables::from_message(&message, &masker);
        assert_eq!(vars.get("my_secret"), Some("password123".to_string()));
        assert_eq!(masker.mask_secrets("password123"), "***");
    }

    #[test]
    fn typed_knobs() {
        let vars = Variables::new();
        assert!(!vars.step_debug());
        vars.set(actions::STEP_DEBUG, "TRUE", false);
        assert!(vars.step_debug());
        vars.set(actions::ALLOW_UNSUPPORTED_COMMANDS, "1", false);
        assert!(vars.allow_unsecure_commands());
        assert_eq!(vars.get_bool("missing"), None);
    }
}
