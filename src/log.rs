//! Logging capability injected into the import controller.
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

pub trait ImportLog: Send + Sync {
    fn log(&self, message: &str, severity: Severity);
}

/// Used when no logger is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLog;

impl ImportLog for NoopLog {
    fn log(&self, _message: &str, _severity: Severity) {}
}

/// Forwards to `tracing` under the `csv_import` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl ImportLog for TracingLog {
    fn log(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Debug => debug!(target: "csv_import", "{}", message),
            Severity::Info => info!(target: "csv_import", "{}", message),
            Severity::Warn => warn!(target: "csv_import", "{}", message),
            Severity::Error => error!(target: "csv_import", "{}", message),
        }
    }
}
