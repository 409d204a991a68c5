//! Tracing subscriber setup for hosts that embed the runtime
//!
//! The core only emits `tracing` events; hosts decide how to collect them.
//! These helpers cover the common cases. Both are no-ops when a subscriber
//! is already installed.

use tracing_subscriber::EnvFilter;

/// Installs a human-readable subscriber filtered by `RUST_LOG`.
pub fn init_observability() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Installs a JSON subscriber filtered by `RUST_LOG`, for log pipelines.
pub fn init_json_observability() {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
