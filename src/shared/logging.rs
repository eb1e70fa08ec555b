//! Structured logging on stderr via `tracing`.
//!
//! JSON verdicts go to stdout and text reports to stderr, so the subscriber
//! always writes to stderr and never interleaves with `--json` output.

use std::sync::Once;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    })
}

/// Initialize the global tracing subscriber.
///
/// Honours `RUST_LOG`; otherwise logs warnings, or everything from debug up
/// when `verbose` is set. Subsequent calls are ignored.
pub fn init_tracing(verbose: bool) {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);

        tracing_subscriber::registry()
            .with(env_filter(verbose))
            .with(fmt_layer)
            .init();

        debug!("pkgsentry tracing initialized");
    });
}

/// Initialize tracing with JSON lines for log shippers.
pub fn init_tracing_json(verbose: bool) {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_current_span(true);

        tracing_subscriber::registry()
            .with(env_filter(verbose))
            .with(fmt_layer)
            .init();

        debug!("pkgsentry tracing initialized (JSON mode)");
    });
}
