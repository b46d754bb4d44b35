// HostContext: process-wide worker state. Directory layout, the shared secret
// masker, trace sources, and the shutdown token that cancels the running job.

use runner_sdk::TraceWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::constants::WellKnownDirectory;
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, Tracing};

const ACTIONS_DIRECTORY: &str = "_actions";
const TEMP_DIRECTORY: &str = "_temp";
const TOOL_DIRECTORY: &str = "_tool";

pub struct HostContext {
    work_directory: PathBuf,
    actions_directory: Option<PathBuf>,
    secret_masker: SecretMasker,
    trace_manager: TraceManager,
    shutdown_token: CancellationToken,
}

impl HostContext {
    pub fn new(work_directory: impl Into<PathBuf>) -> Arc<Self> {
        Self::build(work_directory.into(), None)
    }

    /// Like `new`, but resolves `WellKnownDirectory::Actions` to `actions_directory`.
    pub fn with_actions_directory(
        work_directory: impl Into<PathBuf>,
        actions_directory: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Self::build(work_directory.into(), Some(actions_directory.into()))
    }

    fn build(work_directory: PathBuf, actions_directory: Option<PathBuf>) -> Arc<Self> {
        let secret_masker = SecretMasker::new();
        Arc::new(Self {
            work_directory,
            actions_directory,
            trace_manager: TraceManager::new(secret_masker.clone()),
            secret_masker,
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn get_directory(&self, directory: WellKnownDirectory) -> PathBuf {
        match directory {
            WellKnownDirectory::Work => self.work_directory.clone(),
            WellKnownDirectory::Actions => self
                .actions_directory
                .clone()
                .unwrap_or_else(|| self.work_directory.join(ACTIONS_DIRECTORY)),
            WellKnownDirectory::Temp => self.work_directory.join(TEMP_DIRECTORY),
            WellKnownDirectory::Tools => self.work_directory.join(TOOL_DIRECTORY),
        }
    }

    pub fn work_directory(&self) -> &Path {
        &self.work_directory
    }

    pub fn secret_masker(&self) -> &SecretMasker {
        &self.secret_masker
    }

    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    /// Cancelled when the worker is asked to stop; the running job observes it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self) {
        self.get_trace("HostContext").warning("Worker shutdown requested");
        self.shutdown_token.cancel();
    }
}
