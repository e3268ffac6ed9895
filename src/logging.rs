//! Tracing setup and replay-safe logging for orchestrator code.
//!
//! Orchestrator code runs again on every pass, so a plain `tracing::info!`
//! inside it would repeat once per completion. The `durable_*!` macros and
//! [`OrchestrationContext::trace`](crate::OrchestrationContext::trace) only
//! emit while the code is running live.
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        })
    }
}

/// Install a global fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}

/// Emit buffered orchestrator log lines for one instance.
pub(crate) fn emit(instance: &str, lines: &[(LogLevel, String)]) {
    for (level, message) in lines {
        match level {
            LogLevel::Debug => tracing::debug!(instance = %instance, "{message}"),
            LogLevel::Info => tracing::info!(instance = %instance, "{message}"),
            LogLevel::Warn => tracing::warn!(instance = %instance, "{message}"),
            LogLevel::Error => tracing::error!(instance = %instance, "{message}"),
        }
    }
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::debug!(instance = %$ctx.instance_id(), turn = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(instance = %$ctx.instance_id(), turn = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(instance = %$ctx.instance_id(), turn = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(instance = %$ctx.instance_id(), turn = $ctx.turn_index(), $($arg)+);
        }
    }};
}
