//! Tracing setup and request-scoped trace IDs.
//!
//! The subscriber is installed once per process. Legacy `log::` macros
//! (sea-orm and sqlx still emit them) are bridged into tracing so every
//! line goes through one pipeline. Each admin API request runs inside a
//! task-local [`TraceContext`] whose ID is echoed back on error bodies.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Correlation metadata for one in-flight request.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

task_local! {
    static ACTIVE_TRACE_CONTEXT: TraceContext;
}

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

fn install_log_bridge() {
    if let Err(err) = LogTracer::builder()
        .with_max_level(log::LevelFilter::Trace)
        .init()
    {
        // Another LogTracer (a test harness, usually) already owns the slot.
        if !type_name_of_val(log::logger()).contains("LogTracer") {
            eprintln!(
                "Warning: log bridge not installed ({}); `log::` macros will bypass tracing",
                err
            );
        }
    }
}

/// Install the global subscriber. Safe to call more than once; only the
/// first call wins.
///
/// `RUST_LOG` overrides the configured level. The output format follows
/// `log_format`: `pretty` for local work, JSON otherwise.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    install_log_bridge();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let output = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: tracing subscriber not installed ({}); keeping the existing one",
            err
        );
    }

    Ok(())
}

/// Run `future` with `context` as the task's active trace context.
pub async fn with_trace_context<Fut, R>(context: TraceContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_TRACE_CONTEXT.scope(context, future).await
}

/// Trace ID of the current task, when one is in scope.
pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE_CONTEXT
        .try_with(|ctx| ctx.trace_id.clone())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trace_id_is_scoped_to_the_task() {
        assert!(current_trace_id().is_none());

        let context = TraceContext {
            trace_id: "trace-123".to_string(),
        };
        let seen = with_trace_context(context, async { current_trace_id() }).await;
        assert_eq!(seen.as_deref(), Some("trace-123"));

        assert!(current_trace_id().is_none());
    }
}
