//! Logging setup for the daemon binary.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter` (e.g. `"nestbox_daemon=info"`) when
/// it is set and parses. With `log_json` every event becomes one JSON object
/// per line, spans included, for log shippers; otherwise a compact
/// human-readable format without module targets.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    if log_json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).compact())
            .try_init()
    }
}
