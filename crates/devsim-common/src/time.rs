//! ---
//! devsim_section: "01-core-functionality"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Shared primitives and utilities for the simulation runtime."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::Utc;

/// Wall-clock time as integer milliseconds since the Unix epoch.
pub fn epoch_millis_now() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds into fractional seconds.
pub fn epoch_seconds(timestamp_ms: i64) -> f64 {
    timestamp_ms as f64 / 1000.0
}

/// Round a timestamp down to the start of its sampling period.
pub fn quantize_millis(timestamp_ms: i64, period: Duration) -> i64 {
    let period_ms = period.as_millis().clamp(1, i64::MAX as u128) as i64;
    timestamp_ms - timestamp_ms.rem_euclid(period_ms)
}
