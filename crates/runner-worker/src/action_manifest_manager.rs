// ActionManifestManager: parses `action.yml` into an action definition.
// The `runs` section selects one execution variant; input defaults and
// composite steps are kept as written and evaluated when the action runs.

use anyhow::{Context, Result};
use runner_common::constants::pipeline::{DOCKER_PREFIX, SELF_ALIAS};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::execution_context::ExecutionContext;
use crate::worker::{ActionStep, ActionStepReference};

pub const ACTION_MANIFEST_YML_FILE: &str = "action.yml";
pub const ACTION_MANIFEST_YAML_FILE: &str = "action.yaml";
pub const DOCKERFILE: &str = "Dockerfile";
pub const DOCKERFILE_LOWERCASE: &str = "dockerfile";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to parse action manifest '{path}': {message}")]
    InvalidYaml { path: String, message: String },

    #[error("Action manifest '{0}' does not contain a 'runs' section")]
    MissingRuns(String),

    #[error("'{field}' is required for '{using}' actions in '{path}'")]
    MissingField {
        path: String,
        using: String,
        field: &'static str,
    },

    #[error("Action manifest '{path}' uses an unsupported value '{using}' for 'runs.using'. Supported values are node12, node16, node20, docker, composite, or a 'plugin' entry")]
    UnsupportedUsing { path: String, using: String },

    #[error("Invalid action reference '{0}'")]
    InvalidReference(String),
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    pub inputs: Vec<ActionInput>,
    pub execution: ExecutionData,
}

impl ActionDefinition {
    /// An unnamed definition without inputs.
    pub fn new(execution: ExecutionData) -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            inputs: Vec::new(),
            execution,
        }
    }

    pub fn input(&self, name: &str) -> Option<&ActionInput> {
        self.inputs.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionInput {
    pub name: String,
    /// Template text; may contain `${{ }}` expressions.
    pub default: Option<String>,
    pub deprecation_message: Option<String>,
}

/// How an action runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionData {
    NodeJs(NodeJsExecution),
    Container(ContainerExecution),
    Composite(CompositeExecution),
    Plugin(PluginExecution),
    Script(ScriptExecution),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeJsExecution {
    pub node_version: String,
    pub script: String,
    pub pre: Option<String>,
    pub post: Option<String>,
    pub pre_condition: Option<String>,
    pub post_condition: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerExecution {
    /// `Dockerfile` path relative to the action, or a `docker://` reference.
    pub image: String,
    pub entry_point: Option<String>,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub pre_entry_point: Option<String>,
    pub post_entry_point: Option<String>,
    pub pre_condition: Option<String>,
    pub post_condition: Option<String>,
}

impl ContainerExecution {
    pub fn is_registry_image(&self) -> bool {
        self.image.starts_with(DOCKER_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeExecution {
    pub steps: Vec<ActionStep>,
    /// Output name to value template.
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginExecution {
    pub plugin: String,
    pub post_plugin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptExecution {
    pub script: String,
    pub shell: Option<String>,
    pub working_directory: Option<String>,
}

impl ExecutionData {
    /// Telemetry name of the variant.
    pub fn action_type(&self) -> &'static str {
        match self {
            ExecutionData::NodeJs(_) => "node",
            ExecutionData::Container(_) => "docker",
            ExecutionData::Composite(_) => "composite",
            ExecutionData::Plugin(_) => "plugin",
            ExecutionData::Script(_) => "run",
        }
    }

    pub fn has_pre(&self) -> bool {
        match self {
            ExecutionData::NodeJs(n) => n.pre.is_some(),
            ExecutionData::Container(c) => c.pre_entry_point.is_some(),
            _ => false,
        }
    }

    pub fn has_post(&self) -> bool {
        match self {
            ExecutionData::NodeJs(n) => n.post.is_some(),
            ExecutionData::Container(c) => c.post_entry_point.is_some(),
            ExecutionData::Plugin(p) => p.post_plugin.is_some(),
            _ => false,
        }
    }

    /// Defaults to `always()` for both stages.
    pub fn pre_condition(&self) -> &str {
        let condition = match self {
            ExecutionData::NodeJs(n) => n.pre_condition.as_deref(),
            ExecutionData::Container(c) => c.pre_condition.as_deref(),
            _ => None,
        };
        condition.unwrap_or("always()")
    }

    pub fn post_condition(&self) -> &str {
        let condition = match self {
            ExecutionData::NodeJs(n) => n.post_condition.as_deref(),
            ExecutionData::Container(c) => c.post_condition.as_deref(),
            _ => None,
        };
        condition.unwrap_or("always()")
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub struct ActionManifestManager;

impl ActionManifestManager {
    /// `action.yml`, else `action.yaml`, in `directory`.
    pub fn find_manifest(directory: &Path) -> Option<PathBuf> {
        [ACTION_MANIFEST_YML_FILE, ACTION_MANIFEST_YAML_FILE]
            .iter()
            .map(|f| directory.join(f))
            .find(|p| p.is_file())
    }

    pub fn load(context: &mut ExecutionContext, manifest_path: &Path) -> Result<ActionDefinition> {
        context.debug(&format!("Loading action manifest: {}", manifest_path.display()));
        let content = std::fs::read_to_string(manifest_path)
            .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
        let definition = Self::parse(&content, &manifest_path.to_string_lossy())?;
        for input in &definition.inputs {
            if let Some(message) = &input.deprecation_message {
                context.debug(&format!("Input '{}' is deprecated: {message}", input.name));
            }
        }
        Ok(definition)
    }

    /// Parse manifest text. `path` is only used in error messages.
    pub fn parse(content: &str, path: &str) -> Result<ActionDefinition, ManifestError> {
        let yaml: Value = serde_yaml::from_str(content).map_err(|e| ManifestError::InvalidYaml {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        let inputs = yaml
            .get("inputs")
            .and_then(Value::as_mapping)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| {
                        Some(ActionInput {
                            name: scalar(k)?,
                            default: v.get("default").and_then(scalar),
                            deprecation_message: v.get("deprecationMessage").and_then(scalar),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let runs = yaml
            .get("runs")
            .ok_or_else(|| ManifestError::MissingRuns(path.to_string()))?;

        let mut execution = parse_runs(runs, path)?;
        if let ExecutionData::Composite(composite) = &mut execution {
            composite.outputs = composite_outputs(&yaml);
        }

        Ok(ActionDefinition {
            name: yaml.get("name").and_then(scalar).unwrap_or_default(),
            description: yaml.get("description").and_then(scalar).unwrap_or_default(),
            inputs,
            execution,
        })
    }
}

fn parse_runs(runs: &Value, path: &str) -> Result<ExecutionData, ManifestError> {
    let text = |key: &str| runs.get(key).and_then(scalar);
    let using = text("using").unwrap_or_default();
    let required = |key: &'static str| {
        text(key).filter(|v| !v.is_empty()).ok_or_else(|| ManifestError::MissingField {
            path: path.to_string(),
            using: using.clone(),
            field: key,
        })
    };

    match using.to_lowercase().as_str() {
        "node12" | "node16" | "node20" => Ok(ExecutionData::NodeJs(NodeJsExecution {
            node_version: using.to_lowercase(),
            script: required("main")?,
            pre: text("pre"),
            post: text("post"),
            pre_condition: text("pre-if"),
            post_condition: text("post-if"),
        })),
        "docker" => Ok(ExecutionData::Container(ContainerExecution {
            image: required("image")?,
            entry_point: text("entrypoint"),
            arguments: runs
                .get("args")
                .and_then(Value::as_sequence)
                .map(|s| s.iter().filter_map(scalar).collect())
                .unwrap_or_default(),
            environment: string_map(runs.get("env")),
            pre_entry_point: text("pre-entrypoint"),
            post_entry_point: text("post-entrypoint"),
            pre_condition: text("pre-if"),
            post_condition: text("post-if"),
        })),
        "composite" => {
            let steps = runs
                .get("steps")
                .and_then(Value::as_sequence)
                .ok_or_else(|| ManifestError::MissingField {
                    path: path.to_string(),
                    using: using.clone(),
                    field: "steps",
                })?;
            Ok(ExecutionData::Composite(CompositeExecution {
                steps: steps
                    .iter()
                    .enumerate()
                    .map(|(i, s)| parse_composite_step(i, s))
                    .collect::<Result<_, _>>()?,
                outputs: BTreeMap::new(),
            }))
        }
        "" if text("plugin").is_some() => Ok(ExecutionData::Plugin(PluginExecution {
            plugin: text("plugin").unwrap_or_default(),
            post_plugin: text("post"),
        })),
        _ => Err(ManifestError::UnsupportedUsing {
            path: path.to_string(),
            using,
        }),
    }
}

fn parse_composite_step(index: usize, step: &Value) -> Result<ActionStep, ManifestError> {
    let text = |key: &str| step.get(key).and_then(scalar);

    let reference = match (text("run"), text("uses")) {
        (Some(script), _) => ActionStepReference::Script {
            script,
            shell: text("shell"),
            working_directory: text("working-directory"),
        },
        (None, Some(uses)) => parse_uses(&uses)?,
        (None, None) => return Err(ManifestError::InvalidReference(format!("steps[{index}]"))),
    };

    let name = text("id").unwrap_or_else(|| format!("__{index}"));
    Ok(ActionStep {
        id: Uuid::new_v4().to_string(),
        display_name: text("name").unwrap_or_else(|| name.clone()),
        name,
        condition: text("if"),
        continue_on_error: text("continue-on-error"),
        timeout_in_minutes: step
            .get("timeout-minutes")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok()),
        environment: string_map(step.get("env")).into_iter().collect(),
        inputs: string_map(step.get("with")).into_iter().collect(),
        reference,
    })
}

/// Parse a `uses:` value: `docker://image`, `./local/path`, or
/// `owner/repo[/path]@ref`.
pub fn parse_uses(uses: &str) -> Result<ActionStepReference, ManifestError> {
    if let Some(image) = uses.strip_prefix(DOCKER_PREFIX) {
        return Ok(ActionStepReference::Container {
            image: image.to_string(),
        });
    }
    if uses.starts_with("./") || uses.starts_with(".\\") {
        return Ok(ActionStepReference::Repository {
            name: SELF_ALIAS.to_string(),
            git_ref: String::new(),
            path: Some(uses.to_string()),
        });
    }

    let invalid = || ManifestError::InvalidReference(uses.to_string());
    let (target, git_ref) = uses.split_once('@').ok_or_else(invalid)?;
    let mut segments = target.splitn(3, '/');
    let owner = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let repo = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    if git_ref.is_empty() {
        return Err(invalid());
    }
    Ok(ActionStepReference::Repository {
        name: format!("{owner}/{repo}"),
        git_ref: git_ref.to_string(),
        path: segments.next().map(str::to_string),
    })
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_mapping)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| Some((scalar(k)?, scalar(v).unwrap_or_default())))
                .filter(|(k, _)| !k.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Composite outputs live under the top-level `outputs` key; entries without
/// a `value` are skipped.
fn composite_outputs(yaml: &Value) -> BTreeMap<String, String> {
    yaml.get("outputs")
        .and_then(Value::as_mapping)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| Some((scalar(k)?, v.get("value").and_then(scalar)?)))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_action() {
        let yaml = r#"
name: 'My Action'
inputs:
  name:
    description: 'Name input'
    default: '${{ github.actor }}'
    deprecationMessage: 'use who'
runs:
  using: 'NODE20'
  main: 'index.js'
  post: 'cleanup.js'
  post-if: 'failure()'
"#;
        let def = ActionManifestManager::parse(yaml, "action.yml").unwrap();
        assert_eq!(def.name, "My Action");
        assert_eq!(def.input("NAME").unwrap().default.as_deref(), Some("${{ github.actor }}"));
        assert_eq!(def.input("name").unwrap().deprecation_message.as_deref(), Some("use who"));
        let ExecutionData::NodeJs(node) = &def.execution else {
            panic!("expected node execution");
        };
        assert_eq!(node.script, "index.js");
        assert_eq!(node.node_version, "node20");
        assert!(!def.execution.has_pre());
        assert!(def.execution.has_post());
        assert_eq!(def.execution.post_condition(), "failure()");
        assert_eq!(def.execution.pre_condition(), "always()");
    }

    #[test]
    fn docker_actions_keep_image_as_written() {
        let registry = ActionManifestManager::parse(
            "runs:\n  using: docker\n  image: docker://ubuntu:16.04\n  args: ['--flag', 3]\n  env:\n    A: b\n",
            "action.yml",
        )
        .unwrap();
        let ExecutionData::Container(container) = registry.execution else {
            panic!("expected container execution");
        };
        assert_eq!(container.image, "docker://ubuntu:16.04");
        assert!(container.is_registry_image());
        assert_eq!(container.arguments, vec!["--flag", "3"]);
        assert_eq!(container.environment["A"], "b");

        let build = ActionManifestManager::parse("runs:\n  using: docker\n  image: Dockerfile\n", "a.yml").unwrap();
        let ExecutionData::Container(container) = build.execution else {
            panic!("expected container execution");
        };
        assert!(!container.is_registry_image());
    }

    #[test]
    fn composite_steps() {
        let yaml = r#"
runs:
  using: composite
  steps:
    - id: greet
      run: echo hi
      shell: bash
      if: success()
    - uses: actions/setup-node@v4
      with:
        node-version: 20
    - uses: ./.github/actions/local
"#;
        let def = ActionManifestManager::parse(yaml, "action.yml").unwrap();
        let ExecutionData::Composite(composite) = def.execution else {
            panic!("expected composite execution");
        };
        assert_eq!(composite.steps.len(), 3);
        assert_eq!(composite.steps[0].name, "greet");
        assert_eq!(composite.steps[0].condition.as_deref(), Some("success()"));
        assert_eq!(composite.steps[1].name, "__1");
        assert_eq!(composite.steps[1].inputs["node-version"], "20");
        assert_eq!(composite.steps[1].reference.describe(), "actions/setup-node@v4");
        assert_eq!(
            composite.steps[2].reference,
            ActionStepReference::Repository {
                name: "self".to_string(),
                git_ref: String::new(),
                path: Some("./.github/actions/local".to_string()),
            }
        );
    }

    #[test]
    fn plugin_and_errors() {
        let plugin = ActionManifestManager::parse("runs:\n  plugin: checkout\n  post: cleanup\n", "a.yml").unwrap();
        assert_eq!(
            plugin.execution,
            ExecutionData::Plugin(PluginExecution {
                plugin: "checkout".to_string(),
                post_plugin: Some("cleanup".to_string()),
            })
        );

        let err = ActionManifestManager::parse("runs:\n  using: python\n", "/a/action.yml").unwrap_err();
        assert!(err.to_string().contains("/a/action.yml"));
        let err = ActionManifestManager::parse("runs:\n  using: node16\n", "a.yml").unwrap_err();
        assert!(matches!(err, ManifestError::MissingField { field: "main", .. }));
        let err = ActionManifestManager::parse("name: x\n", "a.yml").unwrap_err();
        assert!(matches!(err, ManifestError::MissingRuns(_)));
    }

    #[test]
    fn uses_references() {
        assert_eq!(
            parse_uses("octo/tools/lint@v1").unwrap(),
            ActionStepReference::Repository {
                name: "octo/tools".to_string(),
                git_ref: "v1".to_string(),
                path: Some("lint".to_string()),
            }
        );
        assert_eq!(
            parse_uses("docker://alpine:3").unwrap(),
            ActionStepReference::Container {
                image: "alpine:3".to_string()
            }
        );
        assert!(parse_uses("no-ref").is_err());
        assert!(parse_uses("octo@").is_err());
    }

    #[test]
    fn composite_outputs_need_a_value() {
        let yaml = "outputs:\n  greeting:\n    value: ${{ steps.greet.outputs.text }}\n  bare:\n    description: none\nruns:\n  using: composite\n  steps: []\n";
        let def = ActionManifestManager::parse(yaml, "action.yml").unwrap();
        let ExecutionData::Composite(composite) = def.execution else {
            panic!("expected composite execution");
        };
        assert!(composite.steps.is_empty());
        assert_eq!(composite.outputs.len(), 1);
        assert_eq!(composite.outputs["greeting"], "${{ steps.greet.outputs.text }}");
    }
}
