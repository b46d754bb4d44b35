// Trace writers.
// Line-oriented diagnostic sinks handed to plugins and other components that
// should not depend on a full execution context.

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// A sink for diagnostic output.
pub trait TraceWriter: Send + Sync {
    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a verbose / debug message.
    fn verbose(&self, message: &str);

    /// Log a warning message.
    fn warning(&self, message: &str) {
        self.info(&format!("##[warning]{message}"));
    }

    /// Log an error message.
    fn error(&self, message: &str) {
        self.info(&format!("##[error]{message}"));
    }
}

/// Forwards every message to the `tracing` crate at the matching level.
#[derive(Debug, Clone, Default)]
pub struct TracingTraceWriter;

impl TraceWriter for TracingTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!("{}", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!("{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!("{}", message);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Default)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}
    fn verbose(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Turns trace calls into raw output lines on a channel.
///
/// Warnings, errors and verbose messages are encoded as workflow commands so
/// the receiving side can route them through its command processing, exactly
/// like lines a child process prints.
#[derive(Debug, Clone)]
pub struct ChannelTraceWriter {
    sender: UnboundedSender<String>,
}

impl ChannelTraceWriter {
    pub fn new(sender: UnboundedSender<String>) -> Self {
        Self { sender }
    }

    fn send(&self, line: String) {
        // The receiver going away means the step is over; late output is dropped.
        if self.sender.send(line).is_err() {
            tracing::debug!("Trace channel closed, dropping output line");
        }
    }
}

impl TraceWriter for ChannelTraceWriter {
    fn info(&self, message: &str) {
        for line in message.lines() {
            self.send(line.to_string());
        }
    }

    fn verbose(&self, message: &str) {
        for line in message.lines() {
            self.send(format!("##[debug]{line}"));
        }
    }

    fn warning(&self, message: &str) {
        self.send(format!("##[warning]{message}"));
    }

    fn error(&self, message: &str) {
        self.send(format!("##[error]{message}"));
    }
}

/// The level of a collected trace message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Info,
    Verbose,
    Warning,
    Error,
}

/// Keeps every message in memory. Used by tests.
#[derive(Debug, Default)]
pub struct CollectingTraceWriter {
    messages: Mutex<Vec<(TraceLevel, String)>>,
}

impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return all collected messages.
    pub fn messages(&self) -> Vec<(TraceLevel, String)> {
        self.messages.lock().clone()
    }

    /// Return the collected messages of one level.
    pub fn messages_at(&self, level: TraceLevel) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn push(&self, level: TraceLevel, message: &str) {
        self.messages.lock().push((level, message.to_string()));
    }
}

impl TraceWriter for CollectingTraceWriter {
    fn info(&self, message: &str) {
        self.push(TraceLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.push(TraceLevel::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.push(TraceLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.push(TraceLevel::Error, message);
    }
}
