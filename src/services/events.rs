//! Structured operational events. Every payload is redacted before it is logged.

use serde_json::Value;

use crate::services::redact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Emit `event` with a JSON payload as a single tracing record.
pub fn emit(level: Level, event: &str, fields: Value) {
    let fields = redact::redact_value(fields);
    match level {
        Level::Debug => tracing::debug!(event, fields = %fields, "{}", event),
        Level::Info => tracing::info!(event, fields = %fields, "{}", event),
        Level::Warn => tracing::warn!(event, fields = %fields, "{}", event),
        Level::Error => tracing::error!(event, fields = %fields, "{}", event),
    }
}
