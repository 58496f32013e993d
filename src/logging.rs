//! Tracing subscriber setup for the controller.
//!
//! - ERROR: unrecoverable failures, undecodable frames
//! - WARN: handled anomalies (unhandled messages, late hellos, keepalive timeouts)
//! - INFO: lifecycle (listening, channel established, switch disconnected)
//! - DEBUG: dispatch and transaction events
//! - TRACE: frame-level activity

use tracing_subscriber::EnvFilter;

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install a human-readable subscriber. `RUST_LOG` sets the filter, `info` by default.
pub fn init() {
    tracing_subscriber::fmt().with_env_filter(filter("info")).init();
}

/// Install a JSON subscriber, selected with `RUST_LOG_FORMAT=json`.
pub fn init_json() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter("info"))
        .init();
}

/// Install a subscriber writing through the test harness. Safe to call from every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}
