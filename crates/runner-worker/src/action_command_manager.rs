// ActionCommandManager: recognizes workflow commands in step output and
// dispatches them to command extensions.
//
// One manager serves one step's output stream. It owns the stop-commands
// gate and the set of command names currently recognized.

use anyhow::Result;
use runner_common::action_command::ActionCommand;
use runner_common::util::task_result_util::TaskResult;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::container::ContainerInfo;
use crate::execution_context::ExecutionContext;

pub const STOP_COMMAND: &str = "stop-commands";

/// Only recognized while an in-process plugin runs.
pub const INTERNAL_SET_REPO_PATH: &str = "internal-set-repo-path";

/// Errors raised by command extensions. The manager turns them into error
/// issues on the step.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Required field '{field}' is missing in ##[{command}] command.")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    #[error("The `{0}` command is disabled. Please upgrade to using Environment Files or opt into unsecure command execution by setting the `ACTIONS_ALLOW_UNSECURE_COMMANDS` environment variable to `true`.")]
    Disabled(&'static str),

    #[error("Invalid echo command value. Possible values can be: 'on', 'off'. Current value is: '{0}'.")]
    InvalidEcho(String),

    #[error("Invalid stop-commands token '{0}'. The token must not be empty or match a workflow command name. To allow it anyway, set ACTIONS_ALLOW_UNSECURE_STOPCOMMAND_TOKENS to 'true'.")]
    InvalidStopToken(String),
}

/// Handles one workflow command.
pub trait ActionCommandExtension: Send + Sync {
    /// The command name, lowercase.
    fn command(&self) -> &'static str;

    /// Never echo this command's line (it may carry a secret).
    fn omit_echo(&self) -> bool {
        false
    }

    fn process_command(
        &self,
        context: &mut ExecutionContext,
        line: &str,
        command: &ActionCommand,
        container: Option<&ContainerInfo>,
    ) -> Result<()>;
}

pub struct ActionCommandManager {
    extensions: HashMap<String, Arc<dyn ActionCommandExtension>>,
    registered_commands: HashSet<String>,
    stop_token: Option<String>,
}

impl ActionCommandManager {
    pub fn new(extensions: &[Arc<dyn ActionCommandExtension>]) -> Self {
        let mut registered_commands = HashSet::new();
        registered_commands.insert(STOP_COMMAND.to_string());

        let mut map = HashMap::new();
        for extension in extensions {
            let name = extension.command().to_lowercase();
            tracing::trace!(command = %name, "Register action command extension");
            if name != INTERNAL_SET_REPO_PATH {
                registered_commands.insert(name.clone());
            }
            map.insert(name, Arc::clone(extension));
        }

        Self {
            extensions: map,
            registered_commands,
            stop_token: None,
        }
    }

    pub fn enable_plugin_internal_command(&mut self) {
        tracing::debug!("Enable plugin internal command extension");
        self.registered_commands.insert(INTERNAL_SET_REPO_PATH.to_string());
    }

    pub fn disable_plugin_internal_command(&mut self) {
        tracing::debug!("Disable plugin internal command extension");
        self.registered_commands.remove(INTERNAL_SET_REPO_PATH);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_token.is_some()
    }

    /// Process `line` if it is a workflow command.
    ///
    /// `Ok(true)` means the line was consumed as a command, including commands
    /// whose extension failed. `Ok(false)` means the line is plain output.
    /// An unsafe stop-commands token is the only `Err`.
    pub fn try_process_command(
        &mut self,
        context: &mut ExecutionContext,
        line: &str,
        container: Option<&ContainerInfo>,
    ) -> Result<bool> {
        if line.is_empty() {
            return Ok(false);
        }

        let Some(command) = ActionCommand::try_parse(line, &self.registered_commands) else {
            return Ok(false);
        };
        let name = command.command.to_lowercase();

        if let Some(token) = &self.stop_token {
            if name == *token {
                context.output(line);
                context.debug("Resume processing commands");
                self.registered_commands.remove(token);
                self.stop_token = None;
                return Ok(true);
            }
            context.debug(&format!(
                "Process commands has been stopped and waiting for '##[{token}]' to resume."
            ));
            return Ok(false);
        }

        if name == STOP_COMMAND {
            self.stop_commands(context, line, &command.data)?;
            return Ok(true);
        }

        let Some(extension) = self.extensions.get(&name).cloned() else {
            context.warning(&format!(
                "Can't find command extension for ##[{}.command].",
                command.command
            ));
            return Ok(true);
        };

        if context.echo_on_action_command && !extension.omit_echo() {
            context.output(line);
        }

        if let Err(e) = extension.process_command(context, line, &command, container) {
            let info = if extension.omit_echo() {
                extension.command()
            } else {
                line
            };
            context.error(&format!("Unable to process command '{info}' successfully."));
            context.error_chain(&e);
            context.command_result = Some(TaskResult::Failed);
        }
        Ok(true)
    }

    fn stop_commands(&mut self, context: &mut ExecutionContext, line: &str, token: &str) -> Result<()> {
        let token = token.trim().to_lowercase();
        if token.is_empty() || self.registered_commands.contains(&token) {
            if !context.variables().allow_unsecure_stop_command_tokens() {
                return Err(CommandError::InvalidStopToken(token).into());
            }
            context.warning(&CommandError::InvalidStopToken(token.clone()).to_string());
        }

        context.output(line);
        context.debug(&format!("Paused processing commands until '##[{token}]' is received"));
        if !token.is_empty() {
            context.services().host.secret_masker().add_value(&token);
        }
        self.registered_commands.insert(token.clone());
        self.stop_token = Some(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_extensions::default_extensions;
    use crate::test_support::TestHost;
    use parking_lot::Mutex;

    struct RecordingExtension {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl ActionCommandExtension for RecordingExtension {
        fn command(&self) -> &'static str {
            self.name
        }

        fn process_command(
            &self,
            _context: &mut ExecutionContext,
            _line: &str,
            command: &ActionCommand,
            _container: Option<&ContainerInfo>,
        ) -> Result<()> {
            self.seen.lock().push(command.data.clone());
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    fn recording(name: &'static str, fail: bool) -> (Arc<dyn ActionCommandExtension>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ext: Arc<dyn ActionCommandExtension> = Arc::new(RecordingExtension {
            name,
            seen: Arc::clone(&seen),
            fail,
        });
        (ext, seen)
    }

    #[test]
    fn parses_both_formats() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        let (ext, seen) = recording("hello", false);
        let mut manager = ActionCommandManager::new(&[ext]);

        assert!(manager.try_process_command(&mut ctx, "##[hello]v1", None).unwrap());
        assert!(manager.try_process_command(&mut ctx, "::hello::v2", None).unwrap());
        assert!(!manager.try_process_command(&mut ctx, "::unknown::x", None).unwrap());
        assert!(!manager.try_process_command(&mut ctx, "", None).unwrap());
        assert_eq!(*seen.lock(), vec!["v1", "v2"]);
    }

    #[test]
    fn stop_commands_suppresses_until_token() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        let (ext, seen) = recording("hello", false);
        let mut manager = ActionCommandManager::new(&[ext]);

        assert!(manager.try_process_command(&mut ctx, "::stop-commands::pause-token", None).unwrap());
        assert!(manager.is_stopped());
        assert!(!manager.try_process_command(&mut ctx, "::hello::ignored", None).unwrap());
        assert!(manager.try_process_command(&mut ctx, "::pause-token::", None).unwrap());
        assert!(!manager.is_stopped());
        assert!(manager.try_process_command(&mut ctx, "::hello::after", None).unwrap());

        assert_eq!(*seen.lock(), vec!["after"]);
        // The token is treated as a secret.
        assert!(ctx.log_lines().iter().all(|l| !l.contains("pause-token")));
    }

    #[test]
    fn unsafe_stop_token_is_rejected() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        let mut manager = ActionCommandManager::new(&default_extensions());

        assert!(manager.try_process_command(&mut ctx, "::stop-commands::", None).is_err());
        assert!(manager.try_process_command(&mut ctx, "::stop-commands::set-output", None).is_err());
        assert!(!manager.is_stopped());
    }

    #[test]
    fn unsafe_stop_token_allowed_by_variable() {
        let host = TestHost::new();
        host.variables.set(
            runner_common::constants::variables::actions::ALLOW_UNSECURE_STOP_COMMAND_TOKENS,
            "true",
            false,
        );
        let mut ctx = host.step_context("step");
        let mut manager = ActionCommandManager::new(&default_extensions());

        assert!(manager.try_process_command(&mut ctx, "::stop-commands::warning", None).unwrap());
        assert!(manager.is_stopped());
        assert_eq!(ctx.record().warning_count, 1);
    }

    #[test]
    fn failing_extension_becomes_error_issue() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        let (ext, _) = recording("explode", true);
        let mut manager = ActionCommandManager::new(&[ext]);

        assert!(manager.try_process_command(&mut ctx, "::explode::now", None).unwrap());
        let record = ctx.record();
        assert_eq!(record.error_count, 2);
        assert_eq!(
            record.issues[0].message,
            "Unable to process command '::explode::now' successfully."
        );
        assert_eq!(record.issues[1].message, "boom");
        assert_eq!(ctx.command_result, Some(TaskResult::Failed));
    }

    #[test]
    fn internal_commands_toggle() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        let mut manager = ActionCommandManager::new(&default_extensions());
        let line = "::internal-set-repo-path repoFullName=octo/repo,workspaceRepo=true::/w/repo/repo";

        assert!(!manager.try_process_command(&mut ctx, line, None).unwrap());
        manager.enable_plugin_internal_command();
        assert!(manager.try_process_command(&mut ctx, line, None).unwrap());
        manager.disable_plugin_internal_command();
        assert!(!manager.try_process_command(&mut ctx, line, None).unwrap());
    }

    #[test]
    fn echo_follows_context_flag() {
        let host = TestHost::new();
        let mut ctx = host.step_context("step");
        let (ext, _) = recording("hello", false);
        let mut manager = ActionCommandManager::new(&[ext]);

        manager.try_process_command(&mut ctx, "::hello::quiet", None).unwrap();
        assert!(ctx.log_lines().is_empty());

        ctx.echo_on_action_command = true;
        manager.try_process_command(&mut ctx, "::hello::loud", None).unwrap();
        assert_eq!(ctx.log_lines(), vec!["::hello::loud"]);
    }
}
