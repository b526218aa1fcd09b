//! Logging utilities for Session View services.
//!
//! # Noise Filtering
//!
//! By default, noisy library modules (hyper, h2, tower_http) are set to
//! `warn` level to reduce log clutter while keeping service logs at the
//! specified level.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Default noisy modules that should be filtered to warn level.
pub const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "h2", "tokio_util", "tower_http"];

/// Build the directive string for the given base level.
fn build_directives(log_level: &str) -> String {
    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{}=warn", module));
    }
    directives
}

/// Build the default EnvFilter with noise suppression.
fn build_filter(log_level: &str) -> EnvFilter {
    // Try environment variable first (allows override)
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    EnvFilter::new(build_directives(log_level))
}

/// Output format selected by `observability.log_format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Anything other than `json` falls back to pretty output.
    pub fn parse(format: &str) -> Self {
        if format.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

/// Span lifecycle events to log.
///
/// Dispatch spans are created at debug level. When the base level shows
/// them, their open and close are logged too, so each session bound by the
/// guard can be followed with its duration.
fn dispatch_span_events(log_level: &str) -> FmtSpan {
    let level = log_level.trim().to_ascii_lowercase();
    if level == "debug" || level == "trace" {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Initialize logging with the given configuration.
///
/// * `log_level` - Base log level (trace, debug, info, warn, error)
/// * `log_format` - `json` for structured output, anything else for pretty
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init_logging(log_level: &str, log_format: &str) {
    let format = LogFormat::parse(log_format);
    let span_events = dispatch_span_events(log_level);

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(span_events.clone())
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_span_events(span_events.clone())
            .with_ansi(true)
            .with_target(false)
            .boxed(),
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(build_filter(log_level))
        .try_init();

    tracing::debug!(
        log_level = %log_level,
        log_format = format.as_str(),
        dispatch_spans = span_events != FmtSpan::NONE,
        "Logging initialized"
    );
}

/// Generate a new request ID.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Create a tracing span for one dispatch of a request through the session guard.
///
/// # Example
///
/// ```ignore
/// let span = dispatch_span!(request_id, dispatch = ?dispatch, path = %path);
/// ```
#[macro_export]
macro_rules! dispatch_span {
    ($request_id:expr) => {
        tracing::debug_span!("dispatch", request_id = %$request_id)
    };
    ($request_id:expr, $($field:tt)*) => {
        tracing::debug_span!("dispatch", request_id = %$request_id, $($field)*)
    };
}
