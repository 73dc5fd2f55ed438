//! Structured error logging

use std::sync::Arc;
use tracing::error;

/// Sink for errors raised while consuming
pub trait Logger: Send + Sync + 'static {
    /// Log an ordinary failure
    fn log_error(&self, err: &anyhow::Error);

    /// Log a fault: a recovered panic or a broken invariant
    fn log_fatal(&self, err: &anyhow::Error);
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn log_error(&self, err: &anyhow::Error) {
        (**self).log_error(err);
    }

    fn log_fatal(&self, err: &anyhow::Error) {
        (**self).log_fatal(err);
    }
}

/// Emits every entry as a `tracing` event
///
/// Each event carries `host`, `facility`, `severity`, `short_message`
/// (the error's display form) and `full_message` (the full cause chain).
#[derive(Debug, Clone)]
pub struct TracingLogger {
    host: String,
    facility: String,
}

impl TracingLogger {
    /// Create a logger tagging entries with `facility` and the local host name
    pub fn new(facility: impl Into<String>) -> Self {
        Self {
            host: host_name(),
            facility: facility.into(),
        }
    }

    /// Override the reported host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Host attached to every entry
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Facility attached to every entry
    pub fn facility(&self) -> &str {
        &self.facility
    }

    fn emit(&self, severity: &'static str, err: &anyhow::Error) {
        error!(
            host = %self.host,
            facility = %self.facility,
            severity,
            short_message = %err,
            full_message = ?err,
            "{}",
            err
        );
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"))
    }
}

impl Logger for TracingLogger {
    fn log_error(&self, err: &anyhow::Error) {
        self.emit("error", err);
    }

    fn log_fatal(&self, err: &anyhow::Error) {
        self.emit("fatal", err);
    }
}

/// Name of the machine, or `localhost` when it cannot be read
pub fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}
