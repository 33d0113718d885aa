//! Diagnostic logging for `simtest`.
//!
//! Diagnostics always go to stderr. Stdout carries the test listing,
//! streamed command output and the final tables, so the two never mix when
//! a session is piped. The filter comes from `SIMTEST_LOG`, then
//! `RUST_LOG`, then the verbosity given on the command line.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding a tracing filter directive.
pub const LOG_ENV: &str = "SIMTEST_LOG";

/// Filter applied when neither environment variable holds a valid directive.
fn fallback_filter(level: Level) -> EnvFilter {
    EnvFilter::new(level.as_str())
}

fn session_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| fallback_filter(level))
}

/// Install the global subscriber; `json` selects newline-delimited JSON
/// lines for log collectors. Only the first call in a process has effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = session_filter(level);
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry().with(filter).with(layer).try_init().ok();
    }
}
