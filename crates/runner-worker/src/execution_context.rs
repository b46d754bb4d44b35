// ExecutionContext: the scope a job or step runs in.
//
// One job context owns the job-wide state (`Global`) and the step queues;
// step contexts created from it share both. Each step context has its own
// timeline record and log, except embedded children (steps of a composite
// action), which write into their parent's.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use runner_common::constants::{MAX_ISSUE_COUNT, MAX_ISSUE_MESSAGE_LENGTH};
use runner_common::timeline::{Issue, IssueType, TimelineRecord, TimelineRecordState};
use runner_common::util::task_result_util::{TaskResult, TaskResultUtil};
use runner_sdk::StringUtil;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::container::ContainerInfo;
use crate::expressions::ExecutionStatus;
use crate::issue_matcher::{IssueMatcherConfig, IssueMatchersConfig};
use crate::services::WorkerServices;
use crate::steps_context::StepsContext;
use crate::variables::Variables;

pub const DEBUG_TAG: &str = "##[debug]";
pub const COMMAND_TAG: &str = "##[command]";
pub const SECTION_TAG: &str = "##[section]";

// ---------------------------------------------------------------------------
// IStep trait
// ---------------------------------------------------------------------------

/// A unit of work the steps runner executes.
pub trait IStep: Send + Sync {
    /// Unique identity within the job. Post-step registration dedups on it.
    fn id(&self) -> &str;

    fn display_name(&self) -> String;

    /// The `steps.<name>` key; empty or `__`-prefixed names are not recorded.
    fn context_name(&self) -> &str {
        ""
    }

    /// Raw `if:` text. `None` means `success()`.
    fn condition(&self) -> Option<&str>;

    fn continue_on_error(&self) -> Option<&str> {
        None
    }

    fn timeout_in_minutes(&self) -> Option<u32> {
        None
    }

    /// Identity shared by the pre, main and post stages of one action.
    fn action_id(&self) -> Option<&str> {
        None
    }

    fn run_async<'a>(
        &'a self,
        context: &'a mut ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Emitted when the job's matcher set changes. A config without patterns
/// means its owner was removed.
#[derive(Debug, Clone)]
pub struct MatcherChangedEvent {
    pub config: IssueMatcherConfig,
}

/// What a step ran, for job telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StepTelemetry {
    pub action_type: String,
    pub reference: Option<String>,
    pub result: Option<TaskResult>,
}

/// Job-wide state visible from every context of the job.
pub struct Global {
    pub job_id: String,
    pub job_display_name: String,
    pub variables: Variables,

    /// Job-level `env:`.
    pub environment_variables: HashMap<String, String>,

    /// Expression contexts from the job message (`github`, `inputs`, ...).
    pub context_data: serde_json::Map<String, Value>,

    /// Added by `add-path`, most recent last.
    pub prepend_path: Vec<String>,

    pub pipeline_directory: Option<PathBuf>,
    pub workspace_directory: Option<PathBuf>,

    pub container_info: Option<ContainerInfo>,
    pub steps_context: StepsContext,
    pub write_debug: bool,

    pub matchers: Vec<IssueMatcherConfig>,
    matcher_listeners: Vec<mpsc::UnboundedSender<MatcherChangedEvent>>,

    /// Keyed by action identity, then state name.
    pub intra_action_states: HashMap<String, HashMap<String, String>>,

    pub job_telemetry: Vec<StepTelemetry>,
}

impl Global {
    pub fn new(job_id: impl Into<String>, job_display_name: impl Into<String>, variables: Variables) -> Self {
        Self {
            job_id: job_id.into(),
            job_display_name: job_display_name.into(),
            write_debug: variables.step_debug(),
            variables,
            environment_variables: HashMap::new(),
            context_data: serde_json::Map::new(),
            prepend_path: Vec::new(),
            pipeline_directory: None,
            workspace_directory: None,
            container_info: None,
            steps_context: StepsContext::new(),
            matchers: Vec::new(),
            matcher_listeners: Vec::new(),
            intra_action_states: HashMap::new(),
            job_telemetry: Vec::new(),
        }
    }

    /// `github.<name>` as a string.
    pub fn github_value(&self, name: &str) -> Option<String> {
        self.context_data
            .get("github")
            .and_then(|g| g.get(name))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn set_github_value(&mut self, name: &str, value: impl Into<String>) {
        let github = self
            .context_data
            .entry("github")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(map) = github {
            map.insert(name.to_string(), Value::String(value.into()));
        }
    }

    fn notify_matcher_changed(&mut self, config: &IssueMatcherConfig) {
        self.matcher_listeners.retain(|listener| {
            listener
                .send(MatcherChangedEvent { config: config.clone() })
                .is_ok()
        });
    }
}

#[derive(Default)]
struct StepQueues {
    job_steps: VecDeque<Arc<dyn IStep>>,
    post_job_steps: Vec<Arc<dyn IStep>>,
    registered_post_ids: HashSet<String>,
}

struct StepLog {
    record: TimelineRecord,
    lines: Vec<String>,
}

impl StepLog {
    fn new(record: TimelineRecord) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            record,
            lines: Vec::new(),
        }))
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

pub struct ExecutionContext {
    services: Arc<WorkerServices>,
    global: Arc<RwLock<Global>>,
    queues: Arc<Mutex<StepQueues>>,
    log: Arc<Mutex<StepLog>>,

    display_name: String,
    scope_name: String,
    context_name: String,
    action_id: Option<String>,
    is_job: bool,
    is_embedded: bool,
    /// Position of an embedded step inside its parent, for issue annotations.
    step_number: Option<u32>,
    depth: u32,
    child_order: u32,

    result: Option<TaskResult>,
    outcome: Option<TaskResult>,

    /// Set when a workflow command fails; folded into the step result.
    pub command_result: Option<TaskResult>,

    pub echo_on_action_command: bool,
    cancel_token: CancellationToken,

    /// `env` for this step: job env overlaid with the step's own.
    pub step_environment: HashMap<String, String>,

    /// Extra expression contexts for this step only (`inputs` inside a
    /// composite action, for example).
    pub expression_overrides: serde_json::Map<String, Value>,

    pub step_telemetry: StepTelemetry,
}

impl ExecutionContext {
    /// Create the job context.
    pub fn new_job(services: Arc<WorkerServices>, global: Global, cancel_token: CancellationToken) -> Self {
        let record = TimelineRecord::new(Uuid::new_v4(), None, global.job_display_name.clone());
        let display_name = global.job_display_name.clone();
        let step_environment = global.environment_variables.clone();
        let ctx = Self {
            services,
            global: Arc::new(RwLock::new(global)),
            queues: Arc::default(),
            log: StepLog::new(record),
            display_name,
            scope_name: String::new(),
            context_name: String::new(),
            action_id: None,
            is_job: true,
            is_embedded: false,
            step_number: None,
            depth: 0,
            child_order: 0,
            result: None,
            outcome: None,
            command_result: None,
            echo_on_action_command: false,
            cancel_token,
            step_environment,
            expression_overrides: serde_json::Map::new(),
            step_telemetry: StepTelemetry::default(),
        };
        ctx.publish_record();
        ctx
    }

    /// Create a step context with its own timeline record and log.
    pub fn create_child(
        &mut self,
        display_name: impl Into<String>,
        scope_name: impl Into<String>,
        context_name: impl Into<String>,
        action_id: Option<String>,
    ) -> Self {
        self.child_order += 1;
        let display_name = display_name.into();
        let mut record = TimelineRecord::new(Uuid::new_v4(), Some(self.record_id()), display_name.clone());
        record.order = Some(self.child_order);

        let child = Self {
            log: StepLog::new(record),
            display_name,
            scope_name: scope_name.into(),
            context_name: context_name.into(),
            action_id,
            is_embedded: false,
            step_number: None,
            cancel_token: CancellationToken::new(),
            ..self.inherit()
        };
        child.publish_record();
        child
    }

    /// Create a context for a step nested in this one. It writes into this
    /// context's log and record, and is cancelled with it.
    pub fn create_embedded_child(
        &mut self,
        scope_name: impl Into<String>,
        context_name: impl Into<String>,
        step_number: u32,
        action_id: Option<String>,
    ) -> Self {
        Self {
            log: Arc::clone(&self.log),
            display_name: self.display_name.clone(),
            scope_name: scope_name.into(),
            context_name: context_name.into(),
            action_id,
            is_embedded: true,
            step_number: Some(step_number),
            cancel_token: self.cancel_token.child_token(),
            depth: self.depth + 1,
            ..self.inherit()
        }
    }

    fn inherit(&self) -> Self {
        let echo = self.global.read().write_debug;
        Self {
            services: Arc::clone(&self.services),
            global: Arc::clone(&self.global),
            queues: Arc::clone(&self.queues),
            log: Arc::clone(&self.log),
            display_name: String::new(),
            scope_name: String::new(),
            context_name: String::new(),
            action_id: None,
            is_job: false,
            is_embedded: false,
            step_number: None,
            depth: self.depth,
            child_order: 0,
            result: None,
            outcome: None,
            command_result: None,
            echo_on_action_command: echo,
            cancel_token: CancellationToken::new(),
            step_environment: self.step_environment.clone(),
            expression_overrides: self.expression_overrides.clone(),
            step_telemetry: StepTelemetry::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn services(&self) -> &Arc<WorkerServices> {
        &self.services
    }

    pub fn global(&self) -> parking_lot::RwLockReadGuard<'_, Global> {
        self.global.read()
    }

    pub fn global_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Global> {
        self.global.write()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    pub fn is_embedded(&self) -> bool {
        self.is_embedded
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn result(&self) -> Option<TaskResult> {
        self.result
    }

    pub fn set_result(&mut self, result: TaskResult) {
        self.result = Some(result);
    }

    pub fn outcome(&self) -> Option<TaskResult> {
        self.outcome
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn record_id(&self) -> Uuid {
        self.log.lock().record.id
    }

    /// Snapshot of this context's timeline record.
    pub fn record(&self) -> TimelineRecord {
        self.log.lock().record.clone()
    }

    /// Lines written to this context's log so far.
    pub fn log_lines(&self) -> Vec<String> {
        self.log.lock().lines.clone()
    }

    pub fn variables(&self) -> Variables {
        self.global.read().variables.clone()
    }

    pub fn write_debug(&self) -> bool {
        self.global.read().write_debug
    }

    pub fn workspace_directory(&self) -> Option<PathBuf> {
        self.global.read().workspace_directory.clone()
    }

    /// Status the `success()` family of functions sees from this context.
    pub fn status(&self) -> ExecutionStatus {
        ExecutionStatus::new(self.result, self.cancel_token.is_cancelled())
    }

    // -----------------------------------------------------------------------
    // Step queues
    // -----------------------------------------------------------------------

    pub fn enqueue_job_step(&self, step: Arc<dyn IStep>) {
        self.queues.lock().job_steps.push_back(step);
    }

    pub fn dequeue_job_step(&self) -> Option<Arc<dyn IStep>> {
        self.queues.lock().job_steps.pop_front()
    }

    pub fn job_step_count(&self) -> usize {
        self.queues.lock().job_steps.len()
    }

    /// Queue a post-job step. Returns `false` when a step with the same id
    /// was already registered.
    pub fn register_post_job_step(&mut self, step: Arc<dyn IStep>) -> bool {
        let mut queues = self.queues.lock();
        if !queues.registered_post_ids.insert(step.id().to_string()) {
            drop(queues);
            self.debug(&format!("Post step '{}' is already registered", step.id()));
            return false;
        }
        queues.post_job_steps.push(step);
        true
    }

    /// Most recently registered first.
    pub fn pop_post_job_step(&self) -> Option<Arc<dyn IStep>> {
        self.queues.lock().post_job_steps.pop()
    }

    pub fn post_job_step_count(&self) -> usize {
        self.queues.lock().post_job_steps.len()
    }

    // -----------------------------------------------------------------------
    // Intra-action state
    // -----------------------------------------------------------------------

    /// State saved by earlier stages of the current action.
    pub fn intra_action_state(&self) -> HashMap<String, String> {
        let Some(action_id) = &self.action_id else {
            return HashMap::new();
        };
        self.global
            .read()
            .intra_action_states
            .get(action_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn save_intra_action_state(&mut self, name: &str, value: &str) {
        if let Some(action_id) = &self.action_id {
            self.global
                .write()
                .intra_action_states
                .entry(action_id.clone())
                .or_default()
                .insert(name.to_string(), value.to_string());
        }
        self.debug(&format!("Save intra-action state {name} = {value}"));
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    /// Mask and append one line, returning its line number in the step log.
    pub fn write(&mut self, tag: Option<&str>, message: &str) -> u64 {
        let masked = self
            .services
            .host
            .secret_masker()
            .mask_secrets(&format!("{}{}", tag.unwrap_or_default(), message));

        let (line_number, record_id) = {
            let mut log = self.log.lock();
            log.lines.push(masked.clone());
            (log.lines.len() as u64, log.record.id)
        };

        tracing::info!(target: "step", step = %self.display_name, "{}", masked);
        let job_id = self.global.read().job_id.clone();
        self.services
            .job_server_queue
            .queue_web_console_line(&job_id, &masked, line_number);
        tracing::trace!(%record_id, line_number, "queued console line");
        line_number
    }

    pub fn output(&mut self, message: &str) {
        self.write(None, message);
    }

    pub fn command(&mut self, message: &str) {
        self.write(Some(COMMAND_TAG), message);
    }

    pub fn section(&mut self, message: &str) {
        self.write(Some(SECTION_TAG), message);
    }

    /// Only written when step debug is on. Multi-line messages are split.
    pub fn debug(&mut self, message: &str) {
        if !self.write_debug() {
            return;
        }
        for line in message.replace("\r\n", "\n").split('\n') {
            self.write(Some(DEBUG_TAG), line);
        }
    }

    pub fn warning(&mut self, message: &str) {
        self.add_issue(Issue::new(IssueType::Warning, message), None);
    }

    pub fn error(&mut self, message: &str) {
        self.add_issue(Issue::new(IssueType::Error, message), None);
    }

    pub fn notice(&mut self, message: &str) {
        self.add_issue(Issue::new(IssueType::Notice, message), None);
    }

    /// Log an error and its causes: the top-level message as an issue, the
    /// full chain as debug output.
    pub fn error_chain(&mut self, err: &anyhow::Error) {
        self.error(&err.to_string());
        self.debug(&format!("{err:#}"));
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    /// Record an issue. Counters always increase; at most `MAX_ISSUE_COUNT`
    /// issues of each type are kept on the record.
    pub fn add_issue(&mut self, mut issue: Issue, log_message: Option<&str>) {
        let masker = self.services.host.secret_masker();
        let log_message = log_message
            .map(str::to_string)
            .unwrap_or_else(|| issue.message.clone());
        issue.message = StringUtil::truncate_chars(&masker.mask_secrets(&issue.message), MAX_ISSUE_MESSAGE_LENGTH)
            .to_string();

        if let Some(step_number) = self.step_number {
            issue.data.insert("stepNumber".to_string(), step_number.to_string());
        }
        if !log_message.is_empty() {
            let line_number = self.write(Some(issue.issue_type.log_tag()), &log_message);
            issue
                .data
                .insert("logFileLineNumber".to_string(), line_number.to_string());
        }

        let mut log = self.log.lock();
        let record = &mut log.record;
        let count = match issue.issue_type {
            IssueType::Error => &mut record.error_count,
            IssueType::Warning => &mut record.warning_count,
            IssueType::Notice => &mut record.notice_count,
        };
        let keep = *count < MAX_ISSUE_COUNT;
        *count += 1;
        if keep {
            record.issues.push(issue);
        }
        let record = record.clone();
        drop(log);
        self.queue_record(&record);
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    pub fn start(&mut self) {
        if self.is_embedded {
            return;
        }
        {
            let mut log = self.log.lock();
            log.record.start_time = Some(Utc::now());
            log.record.state = TimelineRecordState::InProgress;
        }
        self.publish_record();
    }

    /// Finish this context. Defaults the result to `Succeeded`, closes the
    /// timeline record and records the outcome for `steps.<name>`.
    pub fn complete(&mut self, result: Option<TaskResult>) -> TaskResult {
        if let Some(result) = result {
            self.result = Some(result);
        }
        self.fold_command_result();
        let result = *self.result.get_or_insert(TaskResult::Succeeded);

        if !self.is_embedded {
            {
                let mut log = self.log.lock();
                log.record.finish_time = Some(Utc::now());
                log.record.result = Some(result);
                log.record.state = TimelineRecordState::Completed;
            }
            self.publish_record();
        }

        if self.records_step_result() {
            let outcome = self.outcome.unwrap_or(result).to_action_result();
            let mut global = self.global.write();
            global
                .steps_context
                .set_outcome(&self.scope_name, &self.context_name, outcome);
            global
                .steps_context
                .set_conclusion(&self.scope_name, &self.context_name, result.to_action_result());
        }

        if !self.is_job && !self.step_telemetry.action_type.is_empty() {
            self.step_telemetry.result = Some(result);
            self.global.write().job_telemetry.push(self.step_telemetry.clone());
        }

        result
    }

    fn records_step_result(&self) -> bool {
        !self.context_name.is_empty() && !self.context_name.starts_with("__")
    }

    /// Merge a failed workflow command into the step result.
    pub fn fold_command_result(&mut self) {
        if let Some(command_result) = self.command_result.take() {
            self.result = Some(TaskResultUtil::merge_task_results(self.result, command_result));
        }
    }

    /// Turn a failure into success when `continue-on-error` evaluates true.
    /// The original failure stays visible as the outcome.
    pub fn apply_continue_on_error(&mut self, continue_on_error: Option<&str>) {
        if self.result != Some(TaskResult::Failed) {
            return;
        }
        let Some(text) = continue_on_error.filter(|t| !t.trim().is_empty()) else {
            return;
        };

        match self.evaluate_bool(text) {
            Ok(true) => {
                self.outcome = self.result;
                self.result = Some(TaskResult::Succeeded);
                self.debug(&format!(
                    "Updated step result (continue on error). Outcome: {:?}, Result: Succeeded",
                    self.outcome
                ));
            }
            Ok(false) => {}
            Err(e) => {
                self.error(
                    "The step failed and an error occurred when attempting to determine whether to continue on error.",
                );
                self.error(&e.to_string());
            }
        }
    }

    pub fn set_output(&mut self, name: &str, value: &str) {
        if self.context_name.is_empty() {
            // Steps without a name have nowhere to put outputs.
            self.debug(&format!("Skip setting output '{name}' for a step without a name"));
            return;
        }
        let reference = self.global.write().steps_context.set_output(
            &self.scope_name,
            &self.context_name,
            name,
            value,
        );
        self.debug(&format!("{reference}='{value}'"));
    }

    fn publish_record(&self) {
        let record = self.log.lock().record.clone();
        self.queue_record(&record);
    }

    fn queue_record(&self, record: &TimelineRecord) {
        let job_id = self.global.read().job_id.clone();
        self.services
            .job_server_queue
            .queue_timeline_record_update(&job_id, record);
    }

    // -----------------------------------------------------------------------
    // Issue matchers
    // -----------------------------------------------------------------------

    /// Add matchers ahead of the existing ones. An existing matcher with the
    /// same owner is dropped.
    pub fn add_matchers(&mut self, config: IssueMatchersConfig) {
        {
            let mut global = self.global.write();
            let existing = std::mem::take(&mut global.matchers);
            global.matchers = config
                .matchers
                .iter()
                .cloned()
                .chain(existing.into_iter().filter(|m| {
                    !config
                        .matchers
                        .iter()
                        .any(|n| n.owner.eq_ignore_ascii_case(&m.owner))
                }))
                .collect();
            for matcher in &config.matchers {
                global.notify_matcher_changed(matcher);
            }
        }
        let owners = join_owners(config.matchers.iter().map(|m| m.owner.as_str()));
        self.output(&format!("Added matchers: {owners}"));
    }

    pub fn remove_matchers<'a>(&mut self, owners: impl IntoIterator<Item = &'a str>) {
        let owners: Vec<String> = owners.into_iter().map(str::to_lowercase).collect();
        let removed = {
            let mut global = self.global.write();
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut global.matchers)
                .into_iter()
                .partition(|m| owners.contains(&m.owner.to_lowercase()));
            global.matchers = kept;
            for matcher in &removed {
                global.notify_matcher_changed(&IssueMatcherConfig::owner_only(&matcher.owner));
            }
            removed
        };
        let owners = join_owners(removed.iter().map(|m| m.owner.as_str()));
        self.output(&format!("Removed matchers: {owners}"));
    }

    pub fn get_matchers(&self) -> Vec<IssueMatcherConfig> {
        self.global.read().matchers.clone()
    }

    /// Receive every later change to the matcher set.
    pub fn subscribe_matcher_changes(&self) -> mpsc::UnboundedReceiver<MatcherChangedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.global.write().matcher_listeners.push(tx);
        rx
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    /// The contexts expressions in this step can read.
    pub fn expression_values(&self) -> Value {
        let global = self.global.read();
        let mut values = global.context_data.clone();
        values.insert("steps".to_string(), global.steps_context.to_value(&self.scope_name));
        values.insert(
            "env".to_string(),
            serde_json::to_value(&self.step_environment).unwrap_or_default(),
        );
        for (key, value) in &self.expression_overrides {
            values.insert(key.clone(), value.clone());
        }
        Value::Object(values)
    }

    pub fn evaluate_condition(&self, condition: Option<&str>, status: &ExecutionStatus) -> anyhow::Result<bool> {
        self.services
            .evaluator
            .evaluate_condition(condition, &self.expression_values(), status)
    }

    pub fn evaluate_bool(&self, text: &str) -> anyhow::Result<bool> {
        self.services
            .evaluator
            .evaluate_bool(text, &self.expression_values(), &self.status())
    }

    pub fn evaluate_template(&self, text: &str) -> anyhow::Result<String> {
        self.services
            .evaluator
            .evaluate_template(text, &self.expression_values(), &self.status())
    }

    /// Gate for `set-env` and `add-path`: the process environment, then the
    /// step's `env`, then job variables.
    pub fn allow_unsecure_commands(&self) -> bool {
        use runner_common::constants::variables::actions::ALLOW_UNSUPPORTED_COMMANDS;
        std::env::var(ALLOW_UNSUPPORTED_COMMANDS)
            .ok()
            .as_deref()
            .and_then(StringUtil::convert_to_bool)
            .or_else(|| {
                self.step_environment
                    .get(ALLOW_UNSUPPORTED_COMMANDS)
                    .and_then(|v| StringUtil::convert_to_bool(v))
            })
            .unwrap_or_else(|| self.variables().allow_unsecure_commands())
    }
}

fn join_owners<'a>(owners: impl Iterator<Item = &'a str>) -> String {
    owners.map(|o| format!("'{o}'")).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHost;
    use runner_common::ActionResult;

    struct NoopStep {
        id: String,
    }

    impl IStep for NoopStep {
        fn id(&self) -> &str {
            &self.id
        }

        fn display_name(&self) -> String {
            self.id.clone()
        }

        fn condition(&self) -> Option<&str> {
            None
        }

        fn run_async<'a>(
            &'a self,
            _context: &'a mut ExecutionContext,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn step(id: &str) -> Arc<dyn IStep> {
        Arc::new(NoopStep { id: id.to_string() })
    }

    #[test]
    fn issue_counts_are_capped_on_the_record() {
        let host = TestHost::new();
        let mut job = host.job_context();
        let mut ctx = job.create_child("step", "", "step", None);

        for i in 0..15 {
            ctx.add_issue(Issue::new(IssueType::Error, format!("error {i}")), None);
        }
        for i in 0..14 {
            ctx.add_issue(Issue::new(IssueType::Warning, format!("warning {i}")), None);
        }

        let record = ctx.record();
        assert_eq!(record.error_count, 15);
        assert_eq!(record.warning_count, 14);
        assert_eq!(record.issues_of(IssueType::Error).count(), 10);
        assert_eq!(record.issues_of(IssueType::Warning).count(), 10);
        assert_eq!(host.queue.last_record("step").unwrap().error_count, 15);
    }

    #[test]
    fn issue_message_is_masked_truncated_and_numbered() {
        let host = TestHost::new();
        host.services.host.secret_masker().add_value("hunter2");
        let mut job = host.job_context();
        let mut ctx = job.create_child("step", "", "step", None);
        ctx.output("first line");

        let long = format!("hunter2 {}", "x".repeat(5000));
        ctx.add_issue(Issue::new(IssueType::Error, long), None);

        let issue = ctx.record().issues[0].clone();
        assert!(issue.message.starts_with("*** xxx"));
        assert_eq!(issue.message.chars().count(), MAX_ISSUE_MESSAGE_LENGTH);
        assert_eq!(issue.get("logFileLineNumber"), Some("2"));
        assert!(ctx.log_lines()[1].starts_with("##[error]*** x"));
    }

    #[test]
    fn embedded_child_shares_record_and_annotates_step_number() {
        let host = TestHost::new();
        let mut job = host.job_context();
        let mut parent = job.create_child("composite", "", "composite", None);
        let mut inner = parent.create_embedded_child("composite", "inner", 3, None);

        inner.warning("from inside");
        assert_eq!(inner.depth(), 1);

        let record = parent.record();
        assert_eq!(record.warning_count, 1);
        assert_eq!(record.issues[0].get("stepNumber"), Some("3"));
        assert_eq!(parent.log_lines(), vec!["##[warning]from inside".to_string()]);
    }

    #[test]
    fn continue_on_error_adjusts_result_and_outcome() {
        let host = TestHost::new();
        let mut job = host.job_context();

        let mut ctx = job.create_child("a", "", "a", None);
        ctx.set_result(TaskResult::Failed);
        ctx.apply_continue_on_error(Some("true"));
        assert_eq!(ctx.result(), Some(TaskResult::Succeeded));
        assert_eq!(ctx.outcome(), Some(TaskResult::Failed));

        let mut ctx = job.create_child("b", "", "b", None);
        ctx.set_result(TaskResult::Succeeded);
        ctx.apply_continue_on_error(Some("true"));
        assert_eq!(ctx.result(), Some(TaskResult::Succeeded));
        assert_eq!(ctx.outcome(), None);

        for prior in [TaskResult::Failed, TaskResult::Succeeded, TaskResult::Canceled] {
            let mut ctx = job.create_child("c", "", "c", None);
            ctx.set_result(prior);
            ctx.apply_continue_on_error(Some("false"));
            assert_eq!(ctx.result(), Some(prior));
            assert_eq!(ctx.outcome(), None);
        }
    }

    #[test]
    fn continue_on_error_evaluation_failure_is_reported() {
        let host = TestHost::new();
        let mut job = host.job_context();
        let mut ctx = job.create_child("a", "", "a", None);
        ctx.set_result(TaskResult::Failed);
        ctx.apply_continue_on_error(Some("${{ fromJSON('') }}"));
        assert_eq!(ctx.result(), Some(TaskResult::Failed));
        assert_eq!(ctx.record().error_count, 2);
    }

    #[test]
    fn complete_records_steps_context() {
        let host = TestHost::new();
        let mut job = host.job_context();

        let mut ctx = job.create_child("build", "", "build", None);
        ctx.set_result(TaskResult::Failed);
        ctx.apply_continue_on_error(Some("true"));
        assert_eq!(ctx.complete(None), TaskResult::Succeeded);

        let mut hidden = job.create_child("generated", "", "__run", None);
        hidden.complete(Some(TaskResult::Failed));

        let global = job.global();
        let build = global.steps_context.get("", "build").unwrap();
        assert_eq!(build.outcome, Some(ActionResult::Failure));
        assert_eq!(build.conclusion, Some(ActionResult::Success));
        assert!(global.steps_context.get("", "__run").is_none());
        drop(global);

        let record = host.queue.last_record("build").unwrap();
        assert_eq!(record.state, TimelineRecordState::Completed);
        assert_eq!(record.result, Some(TaskResult::Succeeded));
    }

    #[test]
    fn set_output_needs_a_context_name() {
        let host = TestHost::new();
        let mut job = host.job_context();
        let mut unnamed = job.create_child("x", "", "", None);
        unnamed.set_output("a", "1");
        let mut named = job.create_child("y", "", "named", None);
        named.set_output("a", "1");

        let global = job.global();
        assert_eq!(global.steps_context.get("", "named").unwrap().outputs["a"], "1");
        assert!(global.steps_context.get("", "").is_none());
    }

    #[test]
    fn post_job_steps_are_lifo_and_deduplicated() {
        let host = TestHost::new();
        let mut job = host.job_context();
        let mut child = job.create_child("step", "", "", None);

        assert!(child.register_post_job_step(step("a")));
        assert!(child.register_post_job_step(step("b")));
        assert!(!child.register_post_job_step(step("a")));

        assert_eq!(job.post_job_step_count(), 2);
        assert_eq!(job.pop_post_job_step().unwrap().id(), "b");
        assert_eq!(job.pop_post_job_step().unwrap().id(), "a");
        assert!(job.pop_post_job_step().is_none());
    }

    #[test]
    fn intra_action_state_is_shared_by_action_identity() {
        let host = TestHost::new();
        let mut job = host.job_context();
        let mut main = job.create_child("main", "", "", Some("action-1".to_string()));
        main.save_intra_action_state("pid", "42");

        let post = job.create_child("post", "", "", Some("action-1".to_string()));
        assert_eq!(post.intra_action_state().get("pid").map(String::as_str), Some("42"));

        let other = job.create_child("other", "", "", Some("action-2".to_string()));
        assert!(other.intra_action_state().is_empty());
    }

    #[test]
    fn added_matchers_go_first_and_notify() {
        let host = TestHost::new();
        let mut job = host.job_context();
        let mut rx = job.subscribe_matcher_changes();

        let config = |owners: &[&str]| IssueMatchersConfig {
            matchers: owners
                .iter()
                .map(|o| IssueMatcherConfig {
                    owner: o.to_string(),
                    severity: None,
                    patterns: vec![crate::issue_matcher::IssuePatternConfig {
                        pattern: "^(.+)$".to_string(),
                        message: Some(1),
                        ..Default::default()
                    }],
                })
                .collect(),
        };
        job.add_matchers(config(&["a", "b"]));
        job.add_matchers(config(&["c", "A"]));

        let owners: Vec<_> = job.get_matchers().into_iter().map(|m| m.owner).collect();
        assert_eq!(owners, vec!["c", "A", "b"]);

        job.remove_matchers(["B"]);
        let owners: Vec<_> = job.get_matchers().into_iter().map(|m| m.owner).collect();
        assert_eq!(owners, vec!["c", "A"]);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((event.config.owner, event.config.patterns.is_empty()));
        }
        assert_eq!(events.len(), 5);
        assert_eq!(events[4], ("b".to_string(), true));
        assert!(job.log_lines().contains(&"Added matchers: 'a', 'b'".to_string()));
        assert!(job.log_lines().contains(&"Removed matchers: 'b'".to_string()));
    }

    #[test]
    fn debug_lines_follow_step_debug() {
        let host = TestHost::new();
        let mut job = host.job_context();
        job.debug("hidden");
        assert!(job.log_lines().is_empty());

        job.global_mut().write_debug = true;
        job.debug("one\r\ntwo");
        assert_eq!(job.log_lines(), vec!["##[debug]one", "##[debug]two"]);
    }

    #[test]
    fn child_token_is_independent_but_embedded_is_linked() {
        let host = TestHost::new();
        let mut job = host.job_context();
        let mut step = job.create_child("s", "", "", None);
        let embedded = step.create_embedded_child("s", "", 1, None);

        job.cancel_token().cancel();
        assert!(!step.cancel_token().is_cancelled());
        step.cancel_token().cancel();
        assert!(embedded.cancel_token().is_cancelled());
    }
}
