// ActionManager: turns step references into loaded action definitions and
// prepares the container images container actions need.
//
// Definitions are cached per step id. Images are pulled or built once per
// distinct image (or Dockerfile directory) by a setup step that runs before
// the job's own steps.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use runner_common::constants::pipeline::{DOCKER_PREFIX, SELF_ALIAS};
use runner_common::constants::{WellKnownDirectory, CONTAINER_SETUP_MAX_ATTEMPTS, COMPOSITE_ACTIONS_MAX_DEPTH, CURRENT_PLATFORM};
use runner_common::host_context::HostContext;
use runner_sdk::IOUtil;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::action_manifest_manager::{
    ActionDefinition, ActionManifestManager, ContainerExecution, ExecutionData, PluginExecution, ScriptExecution,
    DOCKERFILE, DOCKERFILE_LOWERCASE,
};
use crate::execution_context::{ExecutionContext, IStep};
use crate::handlers::handler::pump_output;
use crate::worker::{ActionStep, ActionStepReference};

/// A definition together with the directory its files live in.
#[derive(Debug, Clone)]
pub struct LoadedAction {
    pub definition: ActionDefinition,
    /// `None` for scripts, registry images and plugins.
    pub directory: Option<PathBuf>,
}

pub struct ActionManager {
    host: Arc<HostContext>,
    definitions: Mutex<HashMap<String, Arc<LoadedAction>>>,
    images: Mutex<HashMap<String, String>>,
}

impl ActionManager {
    pub fn new(host: Arc<HostContext>) -> Self {
        Self {
            host,
            definitions: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
        }
    }

    /// Load every action the steps use (composite actions recursively) and
    /// return one setup step per distinct container image to pull or build.
    /// `job_image` is the job container's image, pulled with the rest.
    pub fn prepare_actions(
        &self,
        context: &mut ExecutionContext,
        steps: &[ActionStep],
        job_image: Option<&str>,
    ) -> Result<Vec<Arc<dyn IStep>>> {
        let mut groups = ImageGroups::default();
        if let Some(image) = job_image {
            groups.pull(image.strip_prefix(DOCKER_PREFIX).unwrap_or(image), None);
        }
        self.collect(context, steps, 0, &mut groups)?;

        if groups.is_empty() {
            return Ok(Vec::new());
        }
        if !CURRENT_PLATFORM.supports_containers() {
            bail!("Container action is only supported on Linux, not on {CURRENT_PLATFORM}");
        }

        let mut setup: Vec<Arc<dyn IStep>> = Vec::new();
        for (_, (image, step_ids)) in groups.pulls {
            context.debug(&format!("Pull '{image}' for {} step(s)", step_ids.len()));
            setup.push(Arc::new(ContainerSetupStep::new(ContainerSetup::Pull { image }, step_ids)));
        }
        for (_, (dockerfile, step_ids)) in groups.builds {
            context.debug(&format!("Build '{}' for {} step(s)", dockerfile.display(), step_ids.len()));
            setup.push(Arc::new(ContainerSetupStep::new(ContainerSetup::Build { dockerfile }, step_ids)));
        }
        Ok(setup)
    }

    fn collect(
        &self,
        context: &mut ExecutionContext,
        steps: &[ActionStep],
        depth: u32,
        groups: &mut ImageGroups,
    ) -> Result<()> {
        if depth > COMPOSITE_ACTIONS_MAX_DEPTH {
            bail!("Composite action depth exceeded max depth {COMPOSITE_ACTIONS_MAX_DEPTH}");
        }
        for step in steps {
            if matches!(step.reference, ActionStepReference::Script { .. }) {
                continue;
            }
            let loaded = self.load_action(context, step)?;
            match &loaded.definition.execution {
                ExecutionData::Container(container) if container.is_registry_image() => {
                    let image = container.image.strip_prefix(DOCKER_PREFIX).unwrap_or(&container.image);
                    groups.pull(image, Some(&step.id));
                }
                ExecutionData::Container(container) => {
                    let directory = loaded
                        .directory
                        .as_deref()
                        .with_context(|| format!("Action '{}' has no directory", step.reference.describe()))?;
                    groups.build(IOUtil::resolve_path(directory, &container.image), &step.id);
                }
                ExecutionData::Composite(composite) => {
                    self.collect(context, &composite.steps, depth + 1, groups)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Resolve what `step` runs. Cached per step id.
    pub fn load_action(&self, context: &mut ExecutionContext, step: &ActionStep) -> Result<Arc<LoadedAction>> {
        if let Some(loaded) = self.definitions.lock().get(&step.id) {
            return Ok(Arc::clone(loaded));
        }

        let loaded = match &step.reference {
            ActionStepReference::Script {
                script,
                shell,
                working_directory,
            } => LoadedAction {
                definition: ActionDefinition::new(ExecutionData::Script(ScriptExecution {
                    script: script.clone(),
                    shell: shell.clone(),
                    working_directory: working_directory.clone(),
                })),
                directory: None,
            },
            ActionStepReference::Container { image } => LoadedAction {
                definition: ActionDefinition::new(ExecutionData::Container(ContainerExecution {
                    image: format!("{DOCKER_PREFIX}{image}"),
                    ..ContainerExecution::default()
                })),
                directory: None,
            },
            ActionStepReference::Plugin { plugin } => LoadedAction {
                definition: ActionDefinition::new(ExecutionData::Plugin(PluginExecution {
                    plugin: plugin.clone(),
                    post_plugin: None,
                })),
                directory: None,
            },
            ActionStepReference::Repository { name, git_ref, path } => {
                let directory = self.action_directory(context, name, git_ref, path.as_deref())?;
                let definition = self.load_definition(context, &directory, &step.reference.describe())?;
                LoadedAction {
                    definition,
                    directory: Some(directory),
                }
            }
        };

        let loaded = Arc::new(loaded);
        self.definitions.lock().insert(step.id.clone(), Arc::clone(&loaded));
        Ok(loaded)
    }

    /// The image prepared for `step_id`, once its setup step has run.
    pub fn cached_image(&self, step_id: &str) -> Option<String> {
        self.images.lock().get(step_id).cloned()
    }

    fn cache_image(&self, step_ids: &[String], image: &str) {
        let mut images = self.images.lock();
        for id in step_ids {
            images.insert(id.clone(), image.to_string());
        }
    }

    fn action_directory(
        &self,
        context: &ExecutionContext,
        name: &str,
        git_ref: &str,
        path: Option<&str>,
    ) -> Result<PathBuf> {
        let path = path.unwrap_or_default();
        let directory = if name.eq_ignore_ascii_case(SELF_ALIAS) {
            let workspace = context
                .workspace_directory()
                .unwrap_or_else(|| self.host.work_directory().to_path_buf());
            IOUtil::resolve_path(&workspace, path)
        } else {
            let (owner, repo) = name
                .split_once('/')
                .with_context(|| format!("Invalid action repository '{name}'"))?;
            let root = self
                .host
                .get_directory(WellKnownDirectory::Actions)
                .join(owner)
                .join(repo)
                .join(git_ref);
            IOUtil::resolve_path(&root, path)
        };

        if !directory.is_dir() {
            bail!(
                "Can't find action '{}'. Expected it under '{}'",
                describe(name, git_ref, path),
                directory.display()
            );
        }
        Ok(directory)
    }

    fn load_definition(&self, context: &mut ExecutionContext, directory: &Path, reference: &str) -> Result<ActionDefinition> {
        if let Some(manifest) = ActionManifestManager::find_manifest(directory) {
            return ActionManifestManager::load(context, &manifest);
        }
        for dockerfile in [DOCKERFILE, DOCKERFILE_LOWERCASE] {
            if directory.join(dockerfile).is_file() {
                context.debug(&format!("Action '{reference}' has no manifest, using its {dockerfile}"));
                return Ok(ActionDefinition::new(ExecutionData::Container(ContainerExecution {
                    image: dockerfile.to_string(),
                    ..ContainerExecution::default()
                })));
            }
        }
        bail!(
            "Can't find 'action.yml', 'action.yaml' or 'Dockerfile' under '{}'. Did you forget to run actions/checkout before running your local action?",
            directory.display()
        )
    }
}

fn describe(name: &str, git_ref: &str, path: &str) -> String {
    match (path.is_empty(), git_ref.is_empty()) {
        (false, true) => path.to_string(),
        (false, false) => format!("{name}/{path}@{git_ref}"),
        (true, _) => format!("{name}@{git_ref}"),
    }
}

/// Container work grouped case-insensitively, keyed by image or Dockerfile.
#[derive(Default)]
struct ImageGroups {
    pulls: BTreeMap<String, (String, Vec<String>)>,
    builds: BTreeMap<String, (PathBuf, Vec<String>)>,
}

impl ImageGroups {
    fn pull(&mut self, image: &str, step_id: Option<&str>) {
        let (_, ids) = self
            .pulls
            .entry(image.to_lowercase())
            .or_insert_with(|| (image.to_string(), Vec::new()));
        ids.extend(step_id.map(str::to_string));
    }

    fn build(&mut self, dockerfile: PathBuf, step_id: &str) {
        let key = dockerfile.display().to_string().to_lowercase();
        let (_, ids) = self.builds.entry(key).or_insert_with(|| (dockerfile, Vec::new()));
        ids.push(step_id.to_string());
    }

    fn is_empty(&self) -> bool {
        self.pulls.is_empty() && self.builds.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Container setup step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ContainerSetup {
    Pull { image: String },
    Build { dockerfile: PathBuf },
}

/// Pulls or builds one image and records it for every step that uses it.
pub struct ContainerSetupStep {
    id: String,
    setup: ContainerSetup,
    step_ids: Vec<String>,
}

impl ContainerSetupStep {
    pub fn new(setup: ContainerSetup, step_ids: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            setup,
            step_ids,
        }
    }

    async fn run(&self, context: &mut ExecutionContext) -> Result<()> {
        let services = Arc::clone(context.services());
        let (image, verb) = match &self.setup {
            ContainerSetup::Pull { image } => (image.clone(), "pull"),
            ContainerSetup::Build { .. } => (format!("runner-action:{}", uuid::Uuid::new_v4().simple()), "build"),
        };

        let mut exit_code = 0;
        for attempt in 1..=CONTAINER_SETUP_MAX_ATTEMPTS {
            let runtime = Arc::clone(&services.container_runtime);
            let cancel = context.cancel_token();
            let (tx, rx) = mpsc::unbounded_channel();
            let setup = self.setup.clone();
            let tag = image.clone();
            let process = async move {
                match &setup {
                    ContainerSetup::Pull { image } => runtime.pull(image, tx, cancel).await,
                    ContainerSetup::Build { dockerfile } => {
                        let build_context = dockerfile.parent().unwrap_or(Path::new("."));
                        runtime.build(build_context, dockerfile, &tag, tx, cancel).await
                    }
                }
            };
            exit_code = pump_output(context, rx, process, |ctx, line| {
                ctx.output(line);
                Ok(())
            })
            .await?;
            if exit_code == 0 {
                break;
            }
            if attempt < CONTAINER_SETUP_MAX_ATTEMPTS {
                let backoff = Duration::from_secs(u64::from(attempt) * 5);
                context.warning(&format!(
                    "Docker {verb} failed with exit code {exit_code}, back off {} seconds before retry.",
                    backoff.as_secs()
                ));
                let cancel = context.cancel_token();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => bail!("Docker {verb} was canceled."),
                }
            }
        }
        if exit_code != 0 {
            bail!("Docker {verb} failed with exit code {exit_code}");
        }

        services.action_manager.cache_image(&self.step_ids, &image);
        context.debug(&format!("Prepared image '{image}' for {} step(s)", self.step_ids.len()));
        Ok(())
    }
}

impl IStep for ContainerSetupStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> String {
        match &self.setup {
            ContainerSetup::Pull { image } => format!("Pull {image}"),
            ContainerSetup::Build { dockerfile } => {
                format!("Build container for action use: '{}'.", dockerfile.display())
            }
        }
    }

    fn condition(&self) -> Option<&str> {
        None
    }

    fn run_async<'a>(
        &'a self,
        context: &'a mut ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.run(context))
    }
}
