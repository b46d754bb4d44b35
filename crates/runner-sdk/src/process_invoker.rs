// ProcessInvoker: spawns a child process, streams its stdout and stderr line by
// line to a channel, and on cancellation escalates SIGINT, SIGTERM, then kill.

use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// The process exited with a non-zero code and the caller required zero.
#[derive(Debug, thiserror::Error)]
#[error("Exit code {exit_code} returned from process: file name '{file_name}', arguments '{arguments}'.")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: String,
}

/// The process was stopped because its cancellation token fired.
#[derive(Debug, thiserror::Error)]
#[error("The process '{file_name}' was canceled.")]
pub struct ProcessCanceledError {
    pub file_name: String,
}

/// Parameters for one process launch.
#[derive(Debug, Clone, Default)]
pub struct ProcessStartInfo {
    pub working_directory: Option<std::path::PathBuf>,
    pub file_name: String,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    pub require_exit_code_zero: bool,
    pub kill_process_on_cancel: bool,
}

impl ProcessStartInfo {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_directory = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, environment: &HashMap<String, String>) -> Self {
        self.environment
            .extend(environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    fn display_arguments(&self) -> String {
        self.arguments.join(" ")
    }
}

pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self { trace }
    }

    /// Run the process to completion, sending every output line to `output`.
    ///
    /// Returns the exit code. A fired cancellation token yields
    /// [`ProcessCanceledError`] once the process has been stopped.
    pub async fn execute(
        &self,
        info: &ProcessStartInfo,
        output: mpsc::UnboundedSender<String>,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        anyhow::ensure!(!info.file_name.is_empty(), "file name must not be empty");

        self.trace.info("Starting process:");
        self.trace.info(&format!("  File name: '{}'", info.file_name));
        self.trace
            .info(&format!("  Arguments: '{}'", info.display_arguments()));
        self.trace.info(&format!(
            "  Working directory: '{}'",
            info.working_directory
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ));

        let mut cmd = Command::new(&info.file_name);
        cmd.args(&info.arguments)
            .envs(&info.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = info.working_directory.as_deref().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to start process '{}' with arguments '{}'",
                info.file_name,
                info.display_arguments()
            )
        })?;
        let pid = child.id().unwrap_or(0);
        self.trace.info(&format!(
            "Process started with process id {pid}, waiting for process exit."
        ));

        let stdout_task = child.stdout.take().map(|s| spawn_reader(s, output.clone()));
        let stderr_task = child.stderr.take().map(|s| spawn_reader(s, output));

        let (exit_code, canceled) = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for process")?;
                (status.code().unwrap_or(-1), false)
            }
            _ = cancellation_token.cancelled() => {
                self.trace.info("Cancellation requested.");
                (self.cancel_and_kill_process(&mut child, info.kill_process_on_cancel).await, true)
            }
        };

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }

        self.trace.info(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {:.2?}.",
            start.elapsed()
        ));

        if canceled {
            return Err(ProcessCanceledError {
                file_name: info.file_name.clone(),
            }
            .into());
        }
        if exit_code != 0 && info.require_exit_code_zero {
            return Err(ProcessExitCodeError {
                exit_code,
                file_name: info.file_name.clone(),
                arguments: info.display_arguments(),
            }
            .into());
        }
        Ok(exit_code)
    }

    async fn cancel_and_kill_process(
        &self,
        child: &mut tokio::process::Child,
        kill_immediately: bool,
    ) -> i32 {
        if !kill_immediately {
            if self.send_signal_and_wait(child, Signal::Int, SIGINT_TIMEOUT).await {
                self.trace.info("Process cancelled successfully through SIGINT.");
                return exit_code_of(child).await;
            }
            if self.send_signal_and_wait(child, Signal::Term, SIGTERM_TIMEOUT).await {
                self.trace.info("Process terminated successfully through SIGTERM.");
                return exit_code_of(child).await;
            }
        }

        self.trace.info(
            "Kill entire process tree since both cancel and terminate signals have been ignored.",
        );
        let _ = child.kill().await;
        exit_code_of(child).await
    }

    /// Returns `true` when the process exited within `timeout`.
    #[cfg(unix)]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        signal: Signal,
        timeout: Duration,
    ) -> bool {
        let Some(pid) = child.id() else {
            return true;
        };
        let sig = match signal {
            Signal::Int => nix::sys::signal::Signal::SIGINT,
            Signal::Term => nix::sys::signal::Signal::SIGTERM,
        };

        self.trace.info(&format!("Sending {sig:?} to process {pid}."));
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
            self.trace
                .info(&format!("{sig:?} signal failed to send to process {pid}."));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        _signal: Signal,
        timeout: Duration,
    ) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}

async fn exit_code_of(child: &mut tokio::process::Child) -> i32 {
    child
        .wait()
        .await
        .map(|s| s.code().unwrap_or(-1))
        .unwrap_or(-1)
}

fn spawn_reader<R>(reader: R, output: mpsc::UnboundedSender<String>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if output.send(line).is_err() {
                break;
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::trace::NullTraceWriter;

    fn invoker() -> ProcessInvoker {
        ProcessInvoker::new(Arc::new(NullTraceWriter))
    }

    #[tokio::test]
    async fn streams_stdout_and_stderr() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let info = ProcessStartInfo::new("sh")
            .arg("-c")
            .arg("echo out; echo err 1>&2");
        let exit_code = invoker()
            .execute(&info, tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit_code, 0);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines.sort();
        assert_eq!(lines, vec!["err".to_string(), "out".to_string()]);
    }

    #[tokio::test]
    async fn reports_non_zero_exit_code() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let info = ProcessStartInfo::new("sh").args(["-c", "exit 3"]);
        let exit_code = invoker()
            .execute(&info, tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit_code, 3);
    }

    #[tokio::test]
    async fn require_exit_code_zero_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut info = ProcessStartInfo::new("sh").args(["-c", "exit 2"]);
        info.require_exit_code_zero = true;
        let err = invoker()
            .execute(&info, tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ProcessExitCodeError>().is_some());
    }

    #[tokio::test]
    async fn missing_executable_is_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let info = ProcessStartInfo::new("nonexistent_command_xyz_123");
        assert!(invoker()
            .execute(&info, tx, CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let info = ProcessStartInfo::new("sleep").arg("30");
        let token = CancellationToken::new();
        token.cancel();
        let err = invoker().execute(&info, tx, token).await.unwrap_err();
        assert!(err.downcast_ref::<ProcessCanceledError>().is_some());
    }
}
