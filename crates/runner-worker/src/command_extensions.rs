// Command extensions: the workflow commands a step can print.

use anyhow::{Context, Result};
use runner_common::action_command::{ActionCommand, CommandProperties};
use runner_common::timeline::{Issue, IssueType};
use runner_sdk::{IOUtil, StringUtil};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::action_command_manager::{ActionCommandExtension, CommandError, INTERNAL_SET_REPO_PATH};
use crate::container::ContainerInfo;
use crate::execution_context::ExecutionContext;
use crate::issue_matcher::IssueMatchersConfig;

/// Environment variables `set-env` may not touch.
const SET_ENV_BLOCK_LIST: &[&str] = &["NODE_OPTIONS"];

/// Every extension the worker registers.
pub fn default_extensions() -> Vec<Arc<dyn ActionCommandExtension>> {
    vec![
        Arc::new(SetEnvCommand),
        Arc::new(SetOutputCommand),
        Arc::new(SaveStateCommand),
        Arc::new(AddMaskCommand),
        Arc::new(AddPathCommand),
        Arc::new(AddMatcherCommand),
        Arc::new(RemoveMatcherCommand),
        Arc::new(DebugCommand),
        Arc::new(IssueCommand::new("warning", IssueType::Warning)),
        Arc::new(IssueCommand::new("error", IssueType::Error)),
        Arc::new(IssueCommand::new("notice", IssueType::Notice)),
        Arc::new(GroupingCommand::new("group")),
        Arc::new(GroupingCommand::new("endgroup")),
        Arc::new(EchoCommand),
        Arc::new(SetRepoPathCommand),
    ]
}

fn required<'a>(command: &'a ActionCommand, name: &'static str, field: &'static str) -> Result<&'a str> {
    command
        .properties
        .get(field)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CommandError::MissingField { command: name, field }.into())
}

/// Host path for a file named in a command: container paths translated,
/// relative paths rooted at the workspace.
fn resolve_command_file(
    context: &ExecutionContext,
    file: &str,
    container: Option<&ContainerInfo>,
) -> Result<PathBuf> {
    let mut path = PathBuf::from(file);
    if let Some(container) = container {
        path = container.translate_to_host_path(&path);
    }
    if path.is_relative() {
        let workspace = workspace_path(context).context("The github workspace is not set")?;
        path = IOUtil::resolve_path(&workspace, file);
    }
    Ok(path)
}

fn workspace_path(context: &ExecutionContext) -> Option<PathBuf> {
    let global = context.global();
    global
        .github_value("workspace")
        .filter(|w| !w.is_empty())
        .map(PathBuf::from)
        .or_else(|| global.workspace_directory.clone())
}

// ---------------------------------------------------------------------------
// Environment and outputs
// ---------------------------------------------------------------------------

pub struct SetEnvCommand;

impl ActionCommandExtension for SetEnvCommand {
    fn command(&self) -> &'static str {
        "set-env"
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        _container: Option<&ContainerInfo>,
    ) -> Result<()> {
        if !context.allow_unsecure_commands() {
            return Err(CommandError::Disabled("set-env").into());
        }
        let name = required(command, "set-env", "name")?;

        if let Some(blocked) = SET_ENV_BLOCK_LIST.iter().find(|b| b.eq_ignore_ascii_case(name)) {
            context.error(&format!(
                "Can't update {blocked} environment variable using ::set-env:: command."
            ));
            return Ok(());
        }

        context
            .global_mut()
            .environment_variables
            .insert(name.to_string(), command.data.clone());
        context.step_environment.insert(name.to_string(), command.data.clone());
        context.debug(&format!("{name}='{}'", command.data));
        Ok(())
    }
}

pub struct SetOutputCommand;

impl ActionCommandExtension for SetOutputCommand {
    fn command(&self) -> &'static str {
        "set-output"
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        _container: Option<&ContainerInfo>,
    ) -> Result<()> {
        let name = required(command, "set-output", "name")?;
        context.set_output(name, &command.data);
        Ok(())
    }
}

pub struct SaveStateCommand;

impl ActionCommandExtension for SaveStateCommand {
    fn command(&self) -> &'static str {
        "save-state"
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        _container: Option<&ContainerInfo>,
    ) -> Result<()> {
        let name = required(command, "save-state", "name")?;
        context.save_intra_action_state(name, &command.data);
        Ok(())
    }
}

pub struct AddMaskCommand;

impl ActionCommandExtension for AddMaskCommand {
    fn command(&self) -> &'static str {
        "add-mask"
    }

    fn omit_echo(&self) -> bool {
        true
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        _container: Option<&ContainerInfo>,
    ) -> Result<()> {
        if command.data.trim().is_empty() {
            context.warning("Can't add secret mask for empty string in ##[add-mask] command.");
            return Ok(());
        }

        if context.echo_on_action_command {
            context.output("::add-mask::***");
        }
        let masker = context.services().host.secret_masker().clone();
        for line in StringUtil::split_lines(&command.data) {
            if !line.trim().is_empty() {
                masker.add_value(line);
            }
        }
        Ok(())
    }
}

pub struct AddPathCommand;

impl ActionCommandExtension for AddPathCommand {
    fn command(&self) -> &'static str {
        "add-path"
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        _container: Option<&ContainerInfo>,
    ) -> Result<()> {
        if !context.allow_unsecure_commands() {
            return Err(CommandError::Disabled("add-path").into());
        }
        if command.data.is_empty() {
            anyhow::bail!("Required field 'path' is missing in ##[add-path] command.");
        }

        let mut global = context.global_mut();
        global.prepend_path.retain(|p| *p != command.data);
        global.prepend_path.push(command.data.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Issue matchers
// ---------------------------------------------------------------------------

pub struct AddMatcherCommand;

impl ActionCommandExtension for AddMatcherCommand {
    fn command(&self) -> &'static str {
        "add-matcher"
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        container: Option<&ContainerInfo>,
    ) -> Result<()> {
        if command.data.is_empty() {
            context.warning("File path must be specified.");
            return Ok(());
        }

        let file = resolve_command_file(context, &command.data, container)?;
        let config = IssueMatchersConfig::load(&file)?;
        if !config.matchers.is_empty() {
            config.validate()?;
            context.add_matchers(config);
        }
        Ok(())
    }
}

pub struct RemoveMatcherCommand;

impl ActionCommandExtension for RemoveMatcherCommand {
    fn command(&self) -> &'static str {
        "remove-matcher"
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        container: Option<&ContainerInfo>,
    ) -> Result<()> {
        let owner = command.properties.get("owner").unwrap_or_default();
        let file = command.data.as_str();

        match (owner.is_empty(), file.is_empty()) {
            (false, false) => context.warning(
                "Either specify an owner name or a file path in ##[remove-matcher] command. Both values cannot be set.",
            ),
            (true, true) => context.warning(
                "Either an owner name or a file path must be specified in ##[remove-matcher] command.",
            ),
            (false, true) => context.remove_matchers([owner]),
            (true, false) => {
                let path = resolve_command_file(context, file, container)?;
                let config = IssueMatchersConfig::load(&path)?;
                if !config.matchers.is_empty() {
                    context.remove_matchers(config.matchers.iter().map(|m| m.owner.as_str()));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log commands
// ---------------------------------------------------------------------------

pub struct DebugCommand;

impl ActionCommandExtension for DebugCommand {
    fn command(&self) -> &'static str {
        "debug"
    }

    fn omit_echo(&self) -> bool {
        true
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        _container: Option<&ContainerInfo>,
    ) -> Result<()> {
        context.debug(&command.data);
        Ok(())
    }
}

/// `warning`, `error` and `notice` annotations.
pub struct IssueCommand {
    name: &'static str,
    issue_type: IssueType,
}

impl IssueCommand {
    pub fn new(name: &'static str, issue_type: IssueType) -> Self {
        Self { name, issue_type }
    }
}

impl ActionCommandExtension for IssueCommand {
    fn command(&self) -> &'static str {
        self.name
    }

    fn omit_echo(&self) -> bool {
        true
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        container: Option<&ContainerInfo>,
    ) -> Result<()> {
        let mut properties = command.properties.clone();
        let mut issue = Issue::new(self.issue_type, command.data.clone());
        issue.data.insert("category".to_string(), "General".to_string());

        if let Some(file) = properties.get("file").filter(|f| !f.is_empty()).map(str::to_string) {
            issue.data.insert("category".to_string(), "Code".to_string());
            let mut host_file = PathBuf::from(&file);
            if let Some(container) = container {
                host_file = container.translate_to_host_path(&host_file);
                properties.insert("file", host_file.to_string_lossy());
            }

            let repository = context.global().github_value("repository");
            let workspace = workspace_path(context);
            if let Some(relative) = workspace
                .as_deref()
                .and_then(|w| IOUtil::make_relative(&host_file, w))
                .filter(|r| !r.is_empty())
            {
                if let Some(repository) = repository.filter(|r| !r.is_empty()) {
                    properties.insert("repo", repository);
                }
                properties.insert("file", IOUtil::to_forward_slashes(&relative));
            }
        }

        validate_lines_and_columns(context, &mut properties);

        for (key, value) in properties.iter() {
            issue.data.insert(key.to_string(), value.to_string());
        }
        context.add_issue(issue, None);
        Ok(())
    }
}

/// Drop line and column properties that cannot describe a real range.
fn validate_lines_and_columns(context: &mut ExecutionContext, properties: &mut CommandProperties) {
    let number = |properties: &CommandProperties, key: &str| -> Option<u32> {
        properties.get(key).and_then(|v| v.trim().parse().ok())
    };

    for key in ["line", "endLine", "col", "endColumn"] {
        if properties.contains_key(key) && number(properties, key).is_none() {
            context.debug(&format!("Dropping annotation property '{key}': not a number"));
            properties.remove(key);
        }
    }

    if number(properties, "line").is_none() {
        if let Some(end_line) = properties.get("endLine").map(str::to_string) {
            properties.insert("line", end_line);
        }
    }
    if number(properties, "col").is_none() {
        if let Some(end_column) = properties.get("endColumn").map(str::to_string) {
            properties.insert("col", end_column);
        }
    }

    if let (Some(line), Some(end_line)) = (number(properties, "line"), number(properties, "endLine")) {
        if end_line < line {
            context.debug("Dropping annotation lines: 'endLine' is before 'line'");
            properties.remove("line");
            properties.remove("endLine");
        }
    }

    let line = number(properties, "line");
    let spans_lines = matches!(
        (line, number(properties, "endLine")),
        (Some(start), Some(end)) if start != end
    );
    if line.is_none() || spans_lines {
        properties.remove("col");
        properties.remove("endColumn");
    }

    if let (Some(col), Some(end_col)) = (number(properties, "col"), number(properties, "endColumn")) {
        if end_col < col {
            context.debug("Dropping annotation columns: 'endColumn' is before 'col'");
            properties.remove("col");
            properties.remove("endColumn");
        }
    }
}

/// `group` and `endgroup`.
pub struct GroupingCommand {
    name: &'static str,
}

impl GroupingCommand {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl ActionCommandExtension for GroupingCommand {
    fn command(&self) -> &'static str {
        self.name
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        _container: Option<&ContainerInfo>,
    ) -> Result<()> {
        let data = if self.name == "group" { command.data.as_str() } else { "" };
        context.output(&format!("##[{}]{data}", self.name));
        Ok(())
    }
}

pub struct EchoCommand;

impl ActionCommandExtension for EchoCommand {
    fn command(&self) -> &'static str {
        "echo"
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        _container: Option<&ContainerInfo>,
    ) -> Result<()> {
        match command.data.trim().to_uppercase().as_str() {
            "ON" => {
                context.echo_on_action_command = true;
                context.debug("Setting echo command value to 'on'");
            }
            "OFF" => {
                context.echo_on_action_command = false;
                context.debug("Setting echo command value to 'off'");
            }
            _ => return Err(CommandError::InvalidEcho(command.data.clone()).into()),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal
// ---------------------------------------------------------------------------

pub struct SetRepoPathCommand;

impl ActionCommandExtension for SetRepoPathCommand {
    fn command(&self) -> &'static str {
        INTERNAL_SET_REPO_PATH
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        _line: &str,
        command: &ActionCommand,
        _container: Option<&ContainerInfo>,
    ) -> Result<()> {
        let repo_full_name = required(command, INTERNAL_SET_REPO_PATH, "repoFullName")?;
        let workspace_repo = required(command, INTERNAL_SET_REPO_PATH, "workspaceRepo")?;
        let is_workspace_repo = StringUtil::convert_to_bool(workspace_repo).unwrap_or(false);

        let directory_manager = Arc::clone(&context.services().directory_manager);
        directory_manager.update_repository_directory(
            context,
            repo_full_name,
            Path::new(&command.data),
            is_workspace_repo,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_command_manager::ActionCommandManager;
    use crate::test_support::TestHost;
    use runner_common::constants::variables::actions::ALLOW_UNSUPPORTED_COMMANDS;

    fn run(ctx: &mut ExecutionContext, lines: &[&str]) {
        let mut manager = ActionCommandManager::new(&default_extensions());
        for line in lines {
            assert!(manager.try_process_command(ctx, line, None).unwrap(), "{line}");
        }
    }

    #[test]
    fn set_output_requires_name() {
        let host = TestHost::new();
        let mut ctx = host.step_context("build");
        run(&mut ctx, &["::set-output name=version::1.2.3", "::set-output::nope"]);

        let global = ctx.global();
        assert_eq!(global.steps_context.get("", "build").unwrap().outputs["version"], "1.2.3");
        drop(global);
        assert_eq!(
            ctx.record().issues[1].message,
            "Required field 'name' is missing in ##[set-output] command."
        );
    }

    #[test]
    fn set_env_is_gated_and_blocks_node_options() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        run(&mut ctx, &["::set-env name=FOO::bar"]);
        assert_eq!(ctx.record().error_count, 2);
        assert!(ctx.global().environment_variables.get("FOO").is_none());

        ctx.step_environment.insert(ALLOW_UNSUPPORTED_COMMANDS.to_string(), "true".to_string());
        run(&mut ctx, &["::set-env name=FOO::bar", "::set-env name=node_options::x"]);
        assert_eq!(ctx.global().environment_variables["FOO"], "bar");
        assert_eq!(ctx.step_environment["FOO"], "bar");
        assert_eq!(
            ctx.record().issues.last().unwrap().message,
            "Can't update NODE_OPTIONS environment variable using ::set-env:: command."
        );
    }

    #[test]
    fn add_path_dedups() {
        let host = TestHost::new();
        host.variables.set(ALLOW_UNSUPPORTED_COMMANDS, "true", false);
        let mut ctx = host.step_context("step");
        run(&mut ctx, &["::add-path::/a", "::add-path::/b", "::add-path::/a"]);
        assert_eq!(ctx.global().prepend_path, vec!["/b", "/a"]);
    }

    #[test]
    fn add_mask_masks_each_line() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        run(&mut ctx, &["::add-mask::first%0Asecond", "::add-mask::  "]);

        let masker = host.services.host.secret_masker();
        assert_eq!(masker.mask_secrets("first second"), "*** ***");
        assert_eq!(ctx.record().warning_count, 1);
    }

    #[test]
    fn save_state_is_keyed_by_action() {
        let host = TestHost::new();
        let mut job = host.job_context();
        let mut ctx = job.create_child("main", "", "", Some("my-action".to_string()));
        run(&mut ctx, &["::save-state name=pid::123"]);
        assert_eq!(ctx.intra_action_state()["pid"], "123");
    }

    #[test]
    fn echo_and_grouping() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        run(&mut ctx, &["::echo::on", "::group::Build", "::endgroup::"]);
        assert!(ctx.echo_on_action_command);
        assert_eq!(
            ctx.log_lines(),
            vec!["::group::Build", "##[group]Build", "::endgroup::", "##[endgroup]"]
        );

        run(&mut ctx, &["::echo::OFF", "::echo::maybe"]);
        assert!(!ctx.echo_on_action_command);
        assert_eq!(
            ctx.record().issues[1].message,
            "Invalid echo command value. Possible values can be: 'on', 'off'. Current value is: 'maybe'."
        );
    }

    #[test]
    fn annotation_paths_are_made_relative() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        {
            let mut global = ctx.global_mut();
            global.set_github_value("workspace", "/w/repo");
            global.set_github_value("repository", "octo/repo");
        }
        run(&mut ctx, &["::error file=/w/repo/src/main.rs,line=4,col=2::bad thing"]);

        let issue = &ctx.record().issues[0];
        assert_eq!(issue.message, "bad thing");
        assert_eq!(issue.get("file"), Some("src/main.rs"));
        assert_eq!(issue.get("repo"), Some("octo/repo"));
        assert_eq!(issue.get("category"), Some("Code"));
        assert_eq!(issue.get("line"), Some("4"));
        assert_eq!(issue.get("col"), Some("2"));
    }

    #[test]
    fn annotation_line_and_column_rules() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        run(
            &mut ctx,
            &[
                "::warning line=1,endLine=3,col=2,endColumn=5::spans lines",
                "::warning col=2::no line",
                "::warning endLine=7,endColumn=3::ends only",
                "::warning line=9,endLine=2::reversed",
            ],
        );

        let issues = ctx.record().issues;
        assert_eq!(issues[0].get("line"), Some("1"));
        assert_eq!(issues[0].get("col"), None);
        assert_eq!(issues[1].get("col"), None);
        assert_eq!(issues[2].get("line"), Some("7"));
        assert_eq!(issues[2].get("col"), Some("3"));
        assert_eq!(issues[3].get("line"), None);
        assert_eq!(issues[3].get("category"), Some("General"));
    }

    #[test]
    fn remove_matcher_needs_exactly_one_selector() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        run(
            &mut ctx,
            &["::remove-matcher owner=x::file.json", "::remove-matcher::"],
        );
        let issues = ctx.record().issues;
        assert!(issues[0].message.contains("Both values cannot be set."));
        assert!(issues[1].message.contains("must be specified"));
    }

    #[test]
    fn add_matcher_loads_relative_to_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("matcher.json"),
            r#"{"problemMatcher":[{"owner":"lint","pattern":[{"regexp":"^(.+)$","message":1}]}]}"#,
        )
        .unwrap();

        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        ctx.global_mut()
            .set_github_value("workspace", dir.path().to_string_lossy());
        run(&mut ctx, &["::add-matcher::matcher.json", "::remove-matcher owner=lint::"]);
        assert!(ctx.get_matchers().is_empty());
        assert!(ctx.log_lines().contains(&"Added matchers: 'lint'".to_string()));
        assert!(ctx.log_lines().contains(&"Removed matchers: 'lint'".to_string()));
    }
}
