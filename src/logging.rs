//! Tracing setup for analysis runs.
//!
//! The library only emits `tracing` events and spans: one `info` span per
//! method for CFG construction and for lowering, `warn` for decode failures
//! and skipped methods, `debug` for splits and budgets, `trace` per
//! instruction. Hosts that do not install their own subscriber can use the
//! helpers here; `RUST_LOG` overrides the default directive.

use std::sync::Once;

use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static INIT: Once = Once::new();

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install the global subscriber once. Later calls, and calls after a host
/// installed its own subscriber, do nothing.
pub fn init_tracing_with(format: LogFormat, default_directive: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));
        let registry = tracing_subscriber::registry().with(filter);

        let installed = match format {
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .with_span_events(FmtSpan::CLOSE)
                        .with_thread_names(true)
                        .with_line_number(true),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    fmt::layer()
                        .json()
                        .with_span_events(FmtSpan::CLOSE)
                        .with_thread_ids(true)
                        .with_current_span(true),
                )
                .try_init(),
        };
        if installed.is_ok() {
            info!(?format, directive = default_directive, "isil tracing initialized");
        }
    });
}

pub fn init_tracing() {
    init_tracing_with(LogFormat::Pretty, "info");
}

pub fn init_tracing_json() {
    init_tracing_with(LogFormat::Json, "info");
}

/// `info_span!` for per-method work.
#[macro_export]
macro_rules! span_trace {
    ($name:expr) => {
        tracing::info_span!($name)
    };
    ($name:expr, $($field:tt)*) => {
        tracing::info_span!($name, $($field)*)
    };
}

/// Log an error at `error` level and evaluate to it.
#[macro_export]
macro_rules! log_error {
    ($err:expr) => {{
        let e = $err;
        tracing::error!(error = %e, fatal = e.is_fatal(), "Analysis aborted");
        e
    }};
    ($err:expr, $msg:expr) => {{
        let e = $err;
        tracing::error!(error = %e, fatal = e.is_fatal(), context = $msg, "Analysis aborted");
        e
    }};
}
