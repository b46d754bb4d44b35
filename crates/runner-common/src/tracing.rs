// Named trace sources. Every message is secret-masked and then handed to the
// `tracing` crate with the source name as a field.

use std::sync::Arc;

use runner_sdk::TraceWriter;

use crate::secret_masker::SecretMasker;

/// Trace event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

/// A named trace source sharing the process-wide secret masker.
#[derive(Debug, Clone)]
pub struct Tracing {
    name: Arc<str>,
    secret_masker: SecretMasker,
}

impl Tracing {
    pub fn new(name: &str, secret_masker: SecretMasker) -> Self {
        Self {
            name: Arc::from(name),
            secret_masker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        let source = &*self.name;
        match event_type {
            TraceEventType::Error => tracing::error!(source, "{}", masked),
            TraceEventType::Warning => tracing::warn!(source, "{}", masked),
            TraceEventType::Information => tracing::info!(source, "{}", masked),
            TraceEventType::Verbose => tracing::debug!(source, "{}", masked),
        }
    }

    /// Log an error together with its chain of causes.
    pub fn error_chain(&self, err: &anyhow::Error) {
        self.trace(TraceEventType::Error, &format!("{err:#}"));
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out trace sources that share one secret masker.
#[derive(Debug, Clone)]
pub struct TraceManager {
    secret_masker: SecretMasker,
}

impl TraceManager {
    pub fn new(secret_masker: SecretMasker) -> Self {
        Self { secret_masker }
    }

    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, self.secret_masker.clone())
    }
}
