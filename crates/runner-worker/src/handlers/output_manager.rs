// OutputManager: routes each line a step prints.
// Workflow commands go to the command manager, other lines are run through
// the job's issue matchers, and whatever is left is plain step output.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use runner_common::constants::variables::actions::ISSUE_MATCHER_TIMEOUT;
use runner_common::constants::{DEFAULT_ISSUE_MATCHER_TIMEOUT_SECS, ISSUE_MATCHER_MAX_ATTEMPTS};
use runner_common::timeline::{Issue, IssueType};
use runner_sdk::IOUtil;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::action_command_manager::ActionCommandManager;
use crate::container::ContainerInfo;
use crate::execution_context::{ExecutionContext, MatcherChangedEvent};
use crate::issue_matcher::{IssueMatch, IssueMatcher, IssueMatcherConfig};

static COLOR_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m?").expect("valid color code regex"));

/// Levels walked up from a file when looking for its repository root.
const REPOSITORY_SEARCH_DEPTH: usize = 50;

enum MatchOutcome {
    Matched(IssueMatch),
    NoMatch,
    Removed,
}

pub struct OutputManager {
    command_manager: ActionCommandManager,
    container: Option<ContainerInfo>,
    matchers: Vec<IssueMatcher>,
    matcher_events: mpsc::UnboundedReceiver<MatcherChangedEvent>,
    timeout: Duration,
}

impl OutputManager {
    pub fn new(
        context: &mut ExecutionContext,
        command_manager: ActionCommandManager,
        container: Option<ContainerInfo>,
    ) -> Self {
        let timeout = matcher_timeout(context);
        let matcher_events = context.subscribe_matcher_changes();
        let mut manager = Self {
            command_manager,
            container,
            matchers: Vec::new(),
            matcher_events,
            timeout,
        };
        for config in context.get_matchers() {
            if let Some(matcher) = manager.build_matcher(context, &config) {
                manager.matchers.push(matcher);
            }
        }
        manager
    }

    pub fn command_manager_mut(&mut self) -> &mut ActionCommandManager {
        &mut self.command_manager
    }

    pub fn matcher_owners(&self) -> Vec<String> {
        self.matchers.iter().map(|m| m.owner().to_string()).collect()
    }

    /// Handle one line of step output.
    pub fn on_data_received(&mut self, context: &mut ExecutionContext, line: &str) -> Result<()> {
        self.apply_matcher_changes(context);

        if line.contains("##[") || line.contains("::") {
            if self
                .command_manager
                .try_process_command(context, line, self.container.as_ref())?
            {
                tracing::trace!(step = %context.display_name(), "processed workflow command");
                return Ok(());
            }
            // A command may have changed the matcher set.
            self.apply_matcher_changes(context);
        }

        if self.matchers.is_empty() {
            context.output(line);
            return Ok(());
        }

        let stripped = if line.contains("\x1b[") {
            COLOR_CODE.replace_all(line, "").into_owned()
        } else {
            line.to_string()
        };

        let mut consumed = false;
        let mut index = 0;
        while index < self.matchers.len() {
            let matched = match self.match_with_retries(context, index, &stripped) {
                MatchOutcome::Removed => continue,
                MatchOutcome::NoMatch => {
                    consumed |= self.matchers[index].is_mid_sequence();
                    index += 1;
                    continue;
                }
                MatchOutcome::Matched(matched) => matched,
            };

            for (other_index, other) in self.matchers.iter_mut().enumerate() {
                if other_index != index {
                    other.reset();
                }
            }

            if let Some(issue) = self.convert_to_issue(context, matched) {
                context.add_issue(issue, Some(&stripped));
                return Ok(());
            }
            index += 1;
        }

        if !consumed {
            context.output(line);
        }
        Ok(())
    }

    /// Run one matcher, retrying timeouts. A matcher that keeps timing out is
    /// removed.
    fn match_with_retries(&mut self, context: &mut ExecutionContext, index: usize, line: &str) -> MatchOutcome {
        for attempt in 1..=ISSUE_MATCHER_MAX_ATTEMPTS {
            let matcher = &mut self.matchers[index];
            let timeout = match matcher.try_match(line) {
                Ok(Some(matched)) => return MatchOutcome::Matched(matched),
                Ok(None) => return MatchOutcome::NoMatch,
                Err(timeout) => timeout,
            };
            let owner = matcher.owner().to_string();
            if attempt < ISSUE_MATCHER_MAX_ATTEMPTS {
                context.debug(&format!(
                    "Timeout processing issue matcher '{owner}' against line '{line}'. Exception: {timeout}"
                ));
            } else {
                context.warning(&format!(
                    "Removing issue matcher '{owner}'. Matcher failed {ISSUE_MATCHER_MAX_ATTEMPTS} times. Error: {timeout}"
                ));
            }
        }
        self.matchers.remove(index);
        MatchOutcome::Removed
    }

    fn apply_matcher_changes(&mut self, context: &mut ExecutionContext) {
        while let Ok(event) = self.matcher_events.try_recv() {
            if event.config.patterns.is_empty() {
                self.matchers
                    .retain(|m| !m.owner().eq_ignore_ascii_case(&event.config.owner));
            } else {
                self.upsert_matcher(context, &event.config);
            }
        }
    }

    /// The new matcher is tried first. A matcher with the same owner is
    /// dropped; every other matcher keeps its progress.
    fn upsert_matcher(&mut self, context: &mut ExecutionContext, config: &IssueMatcherConfig) {
        let Some(matcher) = self.build_matcher(context, config) else {
            return;
        };
        self.matchers
            .retain(|m| !m.owner().eq_ignore_ascii_case(&config.owner));
        self.matchers.insert(0, matcher);
    }

    fn build_matcher(&self, context: &mut ExecutionContext, config: &IssueMatcherConfig) -> Option<IssueMatcher> {
        match IssueMatcher::new(config, self.timeout) {
            Ok(m) => Some(m),
            Err(e) => {
                context.debug(&format!("Skipping issue matcher '{}': {e}", config.owner));
                None
            }
        }
    }

    fn convert_to_issue(&self, context: &mut ExecutionContext, matched: IssueMatch) -> Option<Issue> {
        let message = matched.message.clone().unwrap_or_default();
        if message.trim().is_empty() {
            context.debug("Skipping logging an issue for the matched line because the message is empty.");
            return None;
        }

        let severity = matched.severity.clone().unwrap_or_default();
        let issue_type = match severity.to_lowercase().as_str() {
            "" | "error" => IssueType::Error,
            "warning" => IssueType::Warning,
            "notice" => IssueType::Notice,
            _ => {
                context.debug(&format!(
                    "Skipped logging an issue for the matched line because the severity '{severity}' is not supported."
                ));
                return None;
            }
        };

        let mut issue = Issue::new(issue_type, message);

        if let Some(line) = matched.line.as_deref().filter(|l| !l.is_empty()) {
            match line.parse::<u32>() {
                Ok(n) => {
                    issue.data.insert("line".to_string(), n.to_string());
                }
                Err(_) => context.debug(&format!("Unable to parse line number '{line}'")),
            }
        }
        if let Some(column) = matched.column.as_deref().filter(|c| !c.is_empty()) {
            match column.parse::<u32>() {
                Ok(n) => {
                    issue.data.insert("column".to_string(), n.to_string());
                }
                Err(_) => context.debug(&format!("Unable to parse column number '{column}'")),
            }
        }
        if let Some(code) = matched.code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            issue.data.insert("code".to_string(), code.to_string());
        }
        if let Some(file) = matched.file.as_deref().filter(|f| !f.trim().is_empty()) {
            if let Some(relative) = self.resolve_file(context, file, matched.from_path.as_deref()) {
                issue.data.insert("file".to_string(), relative);
            }
        }

        Some(issue)
    }

    /// The issue's file relative to the repository that contains it, or
    /// `None` when it cannot be attributed to one.
    fn resolve_file(&self, context: &mut ExecutionContext, file: &str, from_path: Option<&str>) -> Option<String> {
        let translate = |p: &str| match &self.container {
            Some(container) => container.translate_to_host_path(Path::new(p)),
            None => PathBuf::from(p),
        };

        let mut path = translate(file);
        if path.is_relative() {
            if let Some(from) = from_path.filter(|f| !f.trim().is_empty()) {
                path = translate(from).join(path);
            }
        }

        let github_workspace = context.global().github_value("workspace");
        let workspace = github_workspace
            .filter(|w| !w.is_empty())
            .map(PathBuf::from)
            .or_else(|| context.workspace_directory());
        let Some(workspace) = workspace else {
            context.debug(&format!("Dropping file value '{file}'. The github workspace is not set"));
            return None;
        };

        let path = IOUtil::normalize(&workspace.join(path));
        if !path.is_file() {
            context.debug(&format!("Dropping file value '{}'. Path does not exist", path.display()));
            return None;
        }

        let repository = find_repository_root(&path, &workspace).unwrap_or(workspace);
        match IOUtil::make_relative(&path, &repository) {
            Some(relative) if !relative.is_empty() => Some(relative),
            _ => {
                context.debug(&format!(
                    "Dropping file value '{}'. Path is not under the repo.",
                    path.display()
                ));
                None
            }
        }
    }
}

/// Nearest directory above `file`, within `workspace`, that holds `.git`.
fn find_repository_root(file: &Path, workspace: &Path) -> Option<PathBuf> {
    file.ancestors()
        .skip(1)
        .take(REPOSITORY_SEARCH_DEPTH)
        .take_while(|dir| IOUtil::is_under(dir, workspace))
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Per-line matcher budget: job variable, then process environment, then the
/// default. Values are seconds and must be positive.
fn matcher_timeout(context: &ExecutionContext) -> Duration {
    let parse = |value: Option<String>| {
        value
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    };
    parse(context.variables().get(ISSUE_MATCHER_TIMEOUT))
        .or_else(|| parse(std::env::var(ISSUE_MATCHER_TIMEOUT).ok()))
        .unwrap_or(Duration::from_secs(DEFAULT_ISSUE_MATCHER_TIMEOUT_SECS))
}
