//! Courier tracks in-flight CI workflow runs, estimates their completion time
//! from historical data, polls for status changes, downloads and unpacks the
//! resulting build artifact into a bounded on-device cache, and drives a
//! native install/share action.
//!
//! The crate has no CLI or HTTP surface; it is driven programmatically by a
//! UI layer (watch/unwatch calls) and by an OS-level background scheduler
//! (the [`watcher::RunWatcher::background_tick`] entry point).

pub mod artifact_store;
pub mod conf;
pub mod estimator;
pub mod fetcher;
pub mod installer;
pub mod notifier;
pub mod provider;
pub mod registry;
pub mod watcher;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in epoch milliseconds. All internal timestamps use
/// this representation; RFC3339 strings only exist at the provider boundary.
pub fn epoch_milli() -> u64 {
    let current_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis();

    u64::try_from(current_epoch).unwrap()
}

/// Set up the global tracing subscriber. `level` follows the usual env-filter
/// syntax ("info", "courier=debug", ...). Safe to call more than once; later
/// calls are no-ops.
pub fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::new(level);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
