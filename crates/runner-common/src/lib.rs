// runner-common: shared model for the runner worker.
// Workflow command wire format, results, issues and timeline records, the
// job-server sink, secret masking, and process-wide host state.

pub mod action_command;
pub mod action_result;
pub mod constants;
pub mod host_context;
pub mod job_server_queue;
pub mod secret_masker;
pub mod timeline;
pub mod tracing;
pub mod util;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use action_command::{ActionCommand, CommandProperties};
pub use action_result::ActionResult;
pub use constants::{OsPlatform, WellKnownDirectory, CURRENT_PLATFORM};
pub use host_context::HostContext;
pub use job_server_queue::{ConsoleJobServerQueue, JobServerQueue, MemoryJobServerQueue};
pub use secret_masker::SecretMasker;
pub use timeline::{Issue, IssueType, TimelineRecord, TimelineRecordState};
pub use crate::tracing::{TraceManager, Tracing};
pub use util::task_result_util::{TaskResult, TaskResultUtil};
