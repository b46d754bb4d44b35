// StepHost: where a step's process runs. On the host through the process
// invoker, or inside the job container through the container runtime.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use runner_sdk::{ProcessInvoker, ProcessStartInfo, TraceWriter};

use crate::container::{ContainerInfo, ContainerRunOptions, ContainerRuntime};

/// Output lines are sent to `output`; the exit code is returned as-is.
#[async_trait]
pub trait StepHost: Send + Sync {
    /// A host path as the process sees it.
    fn resolve_path(&self, path: &Path) -> String {
        path.display().to_string()
    }

    async fn execute_async(
        &self,
        working_directory: &Path,
        file_name: &str,
        arguments: &[String],
        environment: &HashMap<String, String>,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32>;
}

/// Runs processes directly on the host.
pub struct DefaultStepHost {
    trace: Arc<dyn TraceWriter>,
}

impl DefaultStepHost {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self { trace }
    }
}

#[async_trait]
impl StepHost for DefaultStepHost {
    async fn execute_async(
        &self,
        working_directory: &Path,
        file_name: &str,
        arguments: &[String],
        environment: &HashMap<String, String>,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let info = ProcessStartInfo::new(file_name)
            .args(arguments.iter().cloned())
            .working_directory(working_directory)
            .env(environment);
        ProcessInvoker::new(Arc::clone(&self.trace))
            .execute(&info, output, cancel)
            .await
            .context("Process execution failed")
    }
}

/// Runs processes in the job container. A started container is entered with
/// `exec`; otherwise each process gets a fresh container from the image with
/// the path mappings mounted.
pub struct ContainerStepHost {
    runtime: Arc<dyn ContainerRuntime>,
    container: ContainerInfo,
}

impl ContainerStepHost {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container: ContainerInfo) -> Self {
        Self { runtime, container }
    }
}

#[async_trait]
impl StepHost for ContainerStepHost {
    fn resolve_path(&self, path: &Path) -> String {
        self.container.translate_to_container_path(path).display().to_string()
    }

    async fn execute_async(
        &self,
        working_directory: &Path,
        file_name: &str,
        arguments: &[String],
        environment: &HashMap<String, String>,
        output: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let working_directory = self.resolve_path(working_directory);
        let mut env = self.container.environment.clone();
        env.extend(environment.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(container_id) = &self.container.container_id {
            let command = exec_command(&working_directory, file_name, arguments, &env);
            return self.runtime.exec(container_id, &command, output, cancel).await;
        }

        let options = ContainerRunOptions {
            image: self.container.image.clone(),
            entry_point: Some(file_name.to_string()),
            arguments: arguments.to_vec(),
            environment: env,
            working_directory: Some(working_directory),
            mounts: self.container.path_mappings.clone(),
        };
        self.runtime.run(&options, output, cancel).await
    }
}

// `env K=V ... sh -c 'cd "$0" && exec "$@"' <dir> <file> <args...>`
fn exec_command(
    working_directory: &str,
    file_name: &str,
    arguments: &[String],
    environment: &HashMap<String, String>,
) -> Vec<String> {
    let mut env: Vec<_> = environment.iter().collect();
    env.sort();

    let mut command = vec!["env".to_string()];
    command.extend(env.into_iter().map(|(k, v)| format!("{k}={v}")));
    command.extend([
        "sh".to_string(),
        "-c".to_string(),
        r#"cd "$0" && exec "$@""#.to_string(),
        working_directory.to_string(),
        file_name.to_string(),
    ]);
    command.extend(arguments.iter().cloned());
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingRuntime;

    fn container(id: Option<&str>) -> ContainerInfo {
        let mut info = ContainerInfo::new("docker://node:20");
        info.container_id = id.map(str::to_string);
        info.add_path_mapping("/home/runner/work", "/__w");
        info.environment.insert("FROM_CONTAINER".to_string(), "1".to_string());
        info
    }

    #[test]
    fn exec_command_layout() {
        let mut env = HashMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        let command = exec_command("/__w/repo", "bash", &["-e".to_string(), "x.sh".to_string()], &env);
        assert_eq!(
            command,
            vec!["env", "A=1", "B=2", "sh", "-c", r#"cd "$0" && exec "$@""#, "/__w/repo", "bash", "-e", "x.sh"]
        );
    }

    #[tokio::test]
    async fn started_container_uses_exec() {
        let runtime = Arc::new(RecordingRuntime::default());
        let host = ContainerStepHost::new(runtime.clone(), container(Some("abc123")));
        let (tx, _rx) = mpsc::unbounded_channel();

        let code = host
            .execute_async(
                Path::new("/home/runner/work/repo"),
                "node",
                &["index.js".to_string()],
                &HashMap::new(),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);

        let calls = runtime.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("exec abc123 env FROM_CONTAINER=1 sh -c"));
        assert!(calls[0].ends_with("/__w/repo node index.js"));
    }

    #[tokio::test]
    async fn image_only_container_uses_run_with_mounts() {
        let runtime = Arc::new(RecordingRuntime::default());
        let host = ContainerStepHost::new(runtime.clone(), container(None));
        assert_eq!(host.resolve_path(Path::new("/home/runner/work/a")), "/__w/a");

        let (tx, _rx) = mpsc::unbounded_channel();
        host.execute_async(
            Path::new("/home/runner/work/repo"),
            "bash",
            &[],
            &HashMap::new(),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let runs = runtime.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].image, "node:20");
        assert_eq!(runs[0].entry_point.as_deref(), Some("bash"));
        assert_eq!(runs[0].working_directory.as_deref(), Some("/__w/repo"));
        assert_eq!(runs[0].mounts.len(), 1);
    }
}
