//! The `Logger` capability.
//!
//! The engine consumes structured logging the way it consumes persistence:
//! through a small capability trait, not a concrete sink. Concrete exporters
//! (JSON files, OTLP collectors, …) are deliberately out of scope — callers
//! either supply their own [`Logger`] or take the default [`TracingLogger`],
//! which forwards to the `tracing` crate the rest of the engine already
//! instruments itself with.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a structured log call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Information,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Information => write!(f, "information"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A bag of structured fields attached to a single log call.
pub type Fields = HashMap<String, serde_json::Value>;

/// Structured logging capability consumed by the engine.
///
/// Implementors own where logs go; the engine only ever calls `log` (and,
/// for grouping related calls, `scope`).
pub trait Logger: Send + Sync {
    /// Emit a single structured log entry.
    fn log(&self, level: LogLevel, message: &str, fields: Fields);

    /// Create a scoped logger that merges `fields` into every subsequent
    /// call made through the returned logger. Default implementation
    /// flattens scopes eagerly (no nesting state kept), which is sufficient
    /// for the engine's own call sites.
    fn scope(&self, fields: Fields) -> Box<dyn Logger>
    where
        Self: Sized + Clone + 'static,
    {
        Box::new(ScopedLogger {
            inner: self.clone(),
            scope_fields: fields,
        })
    }
}

struct ScopedLogger<L> {
    inner: L,
    scope_fields: Fields,
}

impl<L: Logger> Logger for ScopedLogger<L> {
    fn log(&self, level: LogLevel, message: &str, mut fields: Fields) {
        for (k, v) in &self.scope_fields {
            fields.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self.inner.log(level, message, fields);
    }
}

/// Default [`Logger`] implementation, forwarding to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, fields: Fields) {
        let fields_json = serde_json::to_string(&fields).unwrap_or_default();
        match level {
            LogLevel::Trace => tracing::trace!(fields = %fields_json, "{message}"),
            LogLevel::Debug => tracing::debug!(fields = %fields_json, "{message}"),
            LogLevel::Information => tracing::info!(fields = %fields_json, "{message}"),
            LogLevel::Warning => tracing::warn!(fields = %fields_json, "{message}"),
            LogLevel::Error | LogLevel::Critical => tracing::error!(fields = %fields_json, "{message}"),
        }
    }
}

/// A [`Logger`] that discards everything. Handy for tests that don't care
/// about log output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: LogLevel, _message: &str, _fields: Fields) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_logger_accepts_any_call() {
        let logger = NullLogger;
        logger.log(LogLevel::Critical, "should be silent", Fields::new());
    }

    #[test]
    fn log_level_ordering_runs_trace_to_critical() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Information);
        assert!(LogLevel::Information < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Critical);
    }
}
