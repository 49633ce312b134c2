//! Telemetry logic.
//! Support logging and metrics.
//!
//! The library only emits `tracing` events and `metrics` counters; installing
//! a subscriber or a recorder is left to the host.

use metrics::{Unit, describe_counter};
use tracing_subscriber::EnvFilter;

pub const BIND_ATTEMPTS: &str = "directory_bind_attempts_total";
pub const CACHE_REQUESTS: &str = "group_cache_requests_total";
pub const CACHE_EVICTIONS: &str = "group_cache_evictions_total";
pub const RESOLUTIONS: &str = "group_resolutions_total";

const DEFAULT_DIRECTIVE: &str = "info";

/// Register metric descriptions on the installed recorder.
pub fn describe_metrics() {
    describe_counter!(
        BIND_ATTEMPTS,
        Unit::Count,
        "Directory bind attempts, labelled by outcome."
    );
    describe_counter!(
        CACHE_REQUESTS,
        Unit::Count,
        "Group cache lookups, labelled by hit or miss."
    );
    describe_counter!(
        CACHE_EVICTIONS,
        Unit::Count,
        "Entries evicted from a full group cache."
    );
    describe_counter!(
        RESOLUTIONS,
        Unit::Count,
        "Group lookups answered by the provider, labelled by outcome."
    );
}

/// Install a formatting subscriber filtered by `RUST_LOG`.
///
/// Defaults to `info` when the variable is absent or invalid.
pub fn setup_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
}
