//! Logging initialization.
//!
//! Filter directives come from `HAMMER_LOG`, then `RUST_LOG`, then default to
//! `info`. `HAMMER_LOG_FORMAT=json` switches to one JSON object per event
//! (with span close events) on stderr; anything else gives compact
//! human-readable lines.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Output format of the subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// JSON objects.
    Json,
}

impl LogFormat {
    /// Interpret a `HAMMER_LOG_FORMAT` value.
    #[must_use]
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Guard held by `main` for the lifetime of the process.
///
/// Logging is synchronous, so dropping it only records that the run ended.
pub struct TelemetryGuard {
    format: LogFormat,
}

impl TelemetryGuard {
    /// The format in effect.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::debug!("telemetry shutdown");
    }
}

/// Pick filter directives: `HAMMER_LOG`, then `RUST_LOG`, then `info`.
#[must_use]
pub fn filter_directives(hammer_log: Option<&str>, rust_log: Option<&str>) -> String {
    [hammer_log, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .unwrap_or("info")
        .to_owned()
}

/// Install the global subscriber.
///
/// Returns a guard that must be held until the program exits.
#[must_use]
pub fn init() -> TelemetryGuard {
    let directives = filter_directives(
        std::env::var("HAMMER_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("warning: invalid log filter {directives:?} ({e}), using 'info'");
        EnvFilter::new("info")
    });
    let format = LogFormat::from_env_value(std::env::var("HAMMER_LOG_FORMAT").ok().as_deref());

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(e) = installed {
        eprintln!("warning: logging already initialized: {e}");
    }

    TelemetryGuard { format }
}
