//! Telemetry Initialization
//!
//! Structured logging via tracing-subscriber. The filter is taken from
//! `RUST_LOG` when set, otherwise a development default.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "quill_api=info,quill_storage=info,tower_http=info";

/// Initialize the global tracing subscriber.
///
/// Call once at startup, before any request handling.
pub fn init_telemetry() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
