// ScriptHandler: runs inline `run:` scripts.
// The script is written to a temp file and handed to the selected shell
// through the step host.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use runner_common::constants::WellKnownDirectory;
use runner_sdk::IOUtil;
use std::path::{Path, PathBuf};

use crate::action_manifest_manager::ExecutionData;
use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{run_process, step_host_for, Handler, HandlerData};

pub struct ScriptHandler;

#[async_trait]
impl Handler for ScriptHandler {
    async fn run_async(&self, context: &mut ExecutionContext, data: &HandlerData) -> Result<()> {
        let ExecutionData::Script(script) = &data.execution else {
            bail!("Script handler cannot run a '{}' action", data.execution.action_type());
        };

        let contents = context.evaluate_template(&script.script)?;
        let shell = match script.shell.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(shell) => ShellCommand::parse(shell)?,
            None => ShellCommand::default_for_platform(),
        };

        let mut lines = contents.lines();
        context.write(
            Some("##[group]"),
            &format!("Run {}", lines.next().unwrap_or_default()),
        );
        for line in lines {
            context.output(line);
        }
        context.output(&format!("shell: {}", shell.display()));
        context.write(Some("##[endgroup]"), "");

        if contents.trim().is_empty() {
            context.debug("Script body is empty, skipping.");
            return Ok(());
        }

        let temp = context.services().host.get_directory(WellKnownDirectory::Temp);
        std::fs::create_dir_all(&temp).with_context(|| format!("Failed to create {}", temp.display()))?;
        let script_file = temp.join(format!("{}.{}", uuid::Uuid::new_v4(), shell.extension));
        std::fs::write(&script_file, &contents)
            .with_context(|| format!("Failed to write script file {}", script_file.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_file, std::fs::Permissions::from_mode(0o755))
                .with_context(|| format!("Failed to mark {} executable", script_file.display()))?;
        }

        let working_directory = resolve_working_directory(context, script.working_directory.as_deref())?;
        let environment = self.prepare_environment(context, data);
        let (host, container) = step_host_for(context);
        let arguments = shell.arguments_for(&host.resolve_path(&script_file));
        context.debug(&format!("{} {}", shell.file, arguments.join(" ")));

        let result = run_process(
            context,
            host,
            container,
            working_directory,
            shell.file.clone(),
            arguments,
            environment,
        )
        .await;

        if let Err(e) = std::fs::remove_file(&script_file) {
            tracing::debug!(file = %script_file.display(), error = %e, "Failed to delete script file");
        }
        result
    }
}

/// `working-directory` rooted at the workspace. Defaults to the workspace,
/// then the work directory.
fn resolve_working_directory(context: &ExecutionContext, working_directory: Option<&str>) -> Result<PathBuf> {
    let workspace = context
        .workspace_directory()
        .unwrap_or_else(|| context.services().host.work_directory().to_path_buf());
    let Some(directory) = working_directory.filter(|d| !d.trim().is_empty()) else {
        return Ok(workspace);
    };
    let directory = context.evaluate_template(directory)?;
    Ok(IOUtil::resolve_path(&workspace, &directory))
}

/// A shell invocation with a `{0}` placeholder for the script path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub file: String,
    pub arguments: Vec<String>,
    pub extension: &'static str,
}

impl ShellCommand {
    fn new(file: &str, arguments: &[&str], extension: &'static str) -> Self {
        Self {
            file: file.to_string(),
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
            extension,
        }
    }

    /// `bash -e {0}` on Unix, `pwsh` on Windows.
    pub fn default_for_platform() -> Self {
        if cfg!(windows) {
            Self::new("pwsh", &["-command", ". '{0}'"], "ps1")
        } else {
            Self::new("bash", &["-e", "{0}"], "sh")
        }
    }

    /// Built-in shell names, or a custom command line containing `{0}`.
    pub fn parse(shell: &str) -> Result<Self> {
        let command = match shell.trim().to_lowercase().as_str() {
            "bash" => Self::new("bash", &["--noprofile", "--norc", "-eo", "pipefail", "{0}"], "sh"),
            "sh" => Self::new("sh", &["-e", "{0}"], "sh"),
            "pwsh" => Self::new("pwsh", &["-command", ". '{0}'"], "ps1"),
            "powershell" => Self::new("powershell", &["-command", ". '{0}'"], "ps1"),
            "python" => Self::new("python", &["{0}"], "py"),
            "cmd" => Self::new("cmd", &["/D", "/E:ON", "/V:OFF", "/S", "/C", "CALL \"{0}\""], "cmd"),
            _ => {
                let mut parts = shell.split_whitespace();
                let Some(file) = parts.next() else {
                    bail!("Shell must not be empty");
                };
                let arguments: Vec<&str> = parts.collect();
                if !arguments.iter().any(|a| a.contains("{0}")) {
                    bail!(
                        "Invalid shell option '{shell}'. Shell must be a valid built-in (bash, sh, cmd, powershell, pwsh, python) or a format string containing '{{0}}'"
                    );
                }
                Self::new(file, &arguments, script_extension(file))
            }
        };
        Ok(command)
    }

    pub fn arguments_for(&self, script_path: &str) -> Vec<String> {
        self.arguments.iter().map(|a| a.replace("{0}", script_path)).collect()
    }

    pub fn display(&self) -> String {
        std::iter::once(self.file.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn script_extension(shell: &str) -> &'static str {
    let stem = Path::new(shell)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(shell)
        .to_lowercase();
    match stem.as_str() {
        "pwsh" | "powershell" => "ps1",
        "python" | "python3" => "py",
        "cmd" => "cmd",
        "node" => "js",
        "ruby" => "rb",
        "perl" => "pl",
        _ => "sh",
    }
}
