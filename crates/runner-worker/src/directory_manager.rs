// DirectoryManager: allocates the pipeline and workspace directories a job
// runs in, and remembers them across runs of the same repository.
//
// Layout under the work directory:
//   _PipelineMapping/<owner>/<repo>/PipelineFolder.json   tracking config
//   <repo>/                                               pipeline directory
//   <repo>/<repo>/                                        default workspace

use anyhow::{bail, Context, Result};
use chrono::Utc;
use runner_common::constants::WellKnownDirectory;
use runner_common::host_context::HostContext;
use runner_sdk::IOUtil;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::execution_context::ExecutionContext;
use crate::worker::WorkspaceOptions;

const PIPELINE_MAPPING_DIRECTORY: &str = "_PipelineMapping";
const TRACKING_CONFIG_FILE: &str = "PipelineFolder.json";

/// Persisted directory allocation for one repository. Paths are relative to
/// the work directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingConfig {
    pub repository_name: String,
    pub pipeline_directory: String,
    pub workspace_directory: String,
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryTracking>,
    pub last_run_on: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryTracking {
    pub repository_path: String,
    pub last_run_on: String,
}

pub trait DirectoryManager: Send + Sync {
    /// Create (and clean, if asked) the job's directories and publish them on
    /// the execution context.
    fn prepare_directory(
        &self,
        context: &mut ExecutionContext,
        workspace: Option<&WorkspaceOptions>,
    ) -> Result<TrackingConfig>;

    /// Record where a repository was checked out. The path must be inside
    /// the pipeline directory.
    fn update_repository_directory(
        &self,
        context: &mut ExecutionContext,
        repository_full_name: &str,
        repository_path: &Path,
        is_workspace_repo: bool,
    ) -> Result<TrackingConfig>;
}

pub struct PipelineDirectoryManager {
    host: Arc<HostContext>,
}

impl PipelineDirectoryManager {
    pub fn new(host: Arc<HostContext>) -> Self {
        Self { host }
    }

    fn work_directory(&self) -> PathBuf {
        self.host.get_directory(WellKnownDirectory::Work)
    }

    fn tracking_file(&self, repository: &str) -> PathBuf {
        self.work_directory()
            .join(PIPELINE_MAPPING_DIRECTORY)
            .join(repository)
            .join(TRACKING_CONFIG_FILE)
    }

    fn load(&self, repository: &str) -> Result<Option<TrackingConfig>> {
        let file = self.tracking_file(repository);
        if !file.exists() {
            return Ok(None);
        }
        IOUtil::load_object(&file).map(Some)
    }

    fn save(&self, config: &TrackingConfig) -> Result<()> {
        let file = self.tracking_file(&config.repository_name);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&file, json).with_context(|| format!("Failed to write {}", file.display()))
    }

    fn publish(&self, context: &mut ExecutionContext, config: &TrackingConfig) {
        let work = self.work_directory();
        let pipeline = work.join(&config.pipeline_directory);
        let workspace = work.join(&config.workspace_directory);
        let mut global = context.global_mut();
        global.set_github_value("workspace", workspace.to_string_lossy());
        global.pipeline_directory = Some(pipeline);
        global.workspace_directory = Some(workspace);
    }
}

fn repository_name(context: &ExecutionContext) -> Result<String> {
    let Some(repository) = context.global().github_value("repository").filter(|r| !r.is_empty()) else {
        bail!("The github context does not name a repository");
    };
    Ok(repository)
}

fn create_directory(context: &mut ExecutionContext, description: &str, path: &Path, delete_existing: bool) -> Result<()> {
    if delete_existing && path.exists() {
        context.debug(&format!("Delete existing {description}: '{}'", path.display()));
        IOUtil::delete_directory(path)?;
    }
    if !path.exists() {
        context.debug(&format!("Creating {description}: '{}'", path.display()));
        std::fs::create_dir_all(path).with_context(|| format!("Failed to create {description} {}", path.display()))?;
    }
    Ok(())
}

impl DirectoryManager for PipelineDirectoryManager {
    fn prepare_directory(
        &self,
        context: &mut ExecutionContext,
        workspace: Option<&WorkspaceOptions>,
    ) -> Result<TrackingConfig> {
        let repository = repository_name(context)?;
        let now = Utc::now().to_rfc3339();

        let mut config = match self.load(&repository)? {
            Some(config) => {
                tracing::debug!(%repository, "Reusing tracking config");
                config
            }
            None => {
                let short_name = repository.rsplit('/').next().unwrap_or(&repository).to_string();
                let workspace_directory = format!("{short_name}/{short_name}");
                let mut repositories = BTreeMap::new();
                repositories.insert(
                    repository.clone(),
                    RepositoryTracking {
                        repository_path: workspace_directory.clone(),
                        last_run_on: now.clone(),
                    },
                );
                TrackingConfig {
                    repository_name: repository.clone(),
                    pipeline_directory: short_name,
                    workspace_directory,
                    repositories,
                    last_run_on: now.clone(),
                }
            }
        };
        config.last_run_on = now;

        let clean = workspace
            .and_then(|w| w.clean.as_deref())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let work = self.work_directory();
        create_directory(
            context,
            "pipeline directory",
            &work.join(&config.pipeline_directory),
            clean == "all",
        )?;
        create_directory(
            context,
            "workspace directory",
            &work.join(&config.workspace_directory),
            clean == "resources",
        )?;

        self.save(&config)?;
        self.publish(context, &config);
        Ok(config)
    }

    fn update_repository_directory(
        &self,
        context: &mut ExecutionContext,
        repository_full_name: &str,
        repository_path: &Path,
        is_workspace_repo: bool,
    ) -> Result<TrackingConfig> {
        let repository = repository_name(context)?;
        let mut config = self
            .load(&repository)?
            .with_context(|| format!("No tracking config for repository '{repository}'"))?;

        let work = self.work_directory();
        let pipeline = work.join(&config.pipeline_directory);
        let path = IOUtil::normalize(repository_path);
        let under_pipeline = IOUtil::make_relative(&path, &pipeline).is_some_and(|r| !r.is_empty());
        let Some(relative) = IOUtil::make_relative(&path, &work).filter(|_| under_pipeline) else {
            bail!(
                "Repository path '{}' should be located under runner's pipeline directory '{}'.",
                repository_path.display(),
                pipeline.display()
            );
        };

        tracing::info!(repository = repository_full_name, path = %relative, "Update repository path");
        config.repositories.insert(
            repository_full_name.to_string(),
            RepositoryTracking {
                repository_path: relative.clone(),
                last_run_on: Utc::now().to_rfc3339(),
            },
        );
        if is_workspace_repo {
            config.workspace_directory = relative;
        }

        self.save(&config)?;
        self.publish(context, &config);
        Ok(config)
    }
}
