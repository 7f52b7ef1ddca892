//! Tracing subscriber setup.
//!
//! Logs go to stderr so stdout stays free for run summaries. `RUST_LOG`
//! overrides the configured level; debug builds additionally turn on
//! `debug` for this crate.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset.
fn default_directive(level: &str) -> String {
    if cfg!(debug_assertions) {
        format!("{level},firefleet=debug")
    } else {
        level.to_string()
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_target(false)
        .try_init();
}
