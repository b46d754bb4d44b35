// runner-sdk: foundation layer for the runner worker.
// No dependencies on the other runner crates. Path, string and JSON helpers,
// trace writers, process invocation, and the in-process action plugin contract.

pub mod action_plugin;
pub mod io_util;
pub mod path_util;
pub mod process_invoker;
pub mod string_util;
pub mod trace;

pub use action_plugin::{ActionPlugin, ActionPluginContext};
pub use io_util::IOUtil;
pub use path_util::PathUtil;
pub use process_invoker::{ProcessCanceledError, ProcessExitCodeError, ProcessInvoker, ProcessStartInfo};
pub use string_util::StringUtil;
pub use trace::{ChannelTraceWriter, TraceWriter, TracingTraceWriter};
