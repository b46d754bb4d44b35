// ContainerRuntime: the narrow container-engine surface the worker needs
// (pull, build, exec, run). `DockerContainerRuntime` drives the docker CLI.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use runner_sdk::{ProcessInvoker, ProcessStartInfo, TraceWriter, TracingTraceWriter};

/// Everything needed to run a container action once.
#[derive(Debug, Clone, Default)]
pub struct ContainerRunOptions {
    pub image: String,
    pub entry_point: Option<String>,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    pub working_directory: Option<String>,
    /// `host:container` volume mounts.
    pub mounts: Vec<(PathBuf, PathBuf)>,
}

/// Exit codes are returned as-is; callers treat non-zero as failure.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(
        &self,
        image: &str,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32>;

    async fn build(
        &self,
        context: &Path,
        dockerfile: &Path,
        tag: &str,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32>;

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32>;

    async fn run(
        &self,
        options: &ContainerRunOptions,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32>;
}

pub struct DockerContainerRuntime {
    docker_path: String,
    trace: Arc<dyn TraceWriter>,
}

impl DockerContainerRuntime {
    pub fn new() -> Self {
        Self::with_path("docker")
    }

    pub fn with_path(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
            trace: Arc::new(TracingTraceWriter),
        }
    }

    async fn docker(
        &self,
        arguments: Vec<String>,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let info = ProcessStartInfo::new(&self.docker_path).args(arguments);
        ProcessInvoker::new(self.trace.clone())
            .execute(&info, output, cancel)
            .await
    }
}

impl Default for DockerContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerContainerRuntime {
    async fn pull(
        &self,
        image: &str,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        self.docker(vec!["pull".into(), image.into()], output, cancel)
            .await
    }

    async fn build(
        &self,
        context: &Path,
        dockerfile: &Path,
        tag: &str,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let arguments = vec![
            "build".to_string(),
            "-t".to_string(),
            tag.to_string(),
            "-f".to_string(),
            dockerfile.display().to_string(),
            context.display().to_string(),
        ];
        self.docker(arguments, output, cancel).await
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let mut arguments = vec!["exec".to_string(), container_id.to_string()];
        arguments.extend(command.iter().cloned());
        self.docker(arguments, output, cancel).await
    }

    async fn run(
        &self,
        options: &ContainerRunOptions,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        self.docker(run_arguments(options), output, cancel).await
    }
}

fn run_arguments(options: &ContainerRunOptions) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--rm".to_string()];

    let mut env: Vec<_> = options.environment.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    for (host, container) in &options.mounts {
        args.push("-v".to_string());
        args.push(format!("{}:{}", host.display(), container.display()));
    }
    if let Some(dir) = &options.working_directory {
        args.push("--workdir".to_string());
        args.push(dir.clone());
    }
    if let Some(entry_point) = options.entry_point.as_deref().filter(|e| !e.is_empty()) {
        args.push("--entrypoint".to_string());
        args.push(entry_point.to_string());
    }
    args.push(options.image.clone());
    args.extend(options.arguments.iter().cloned());
    args
}
