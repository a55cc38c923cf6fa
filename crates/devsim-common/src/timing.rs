//! ---
//! devsim_section: "01-core-functionality"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Tick lateness tracking for the simulation scheduler."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Running statistics of how far behind its deadline each tick fired.
///
/// Constant memory: mean and variance are folded in per observation.
#[derive(Debug, Default)]
pub struct TickLateness {
    stats: Mutex<RunningStats>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunningStats {
    ticks: u64,
    mean_us: f64,
    m2: f64,
    max_us: f64,
}

impl TickLateness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tick scheduled for `deadline` that actually ran at `fired`.
    /// Early firings count as zero lateness.
    pub fn observe(&self, deadline: Instant, fired: Instant) -> Duration {
        let lateness = fired.saturating_duration_since(deadline);
        self.record(lateness);
        lateness
    }

    pub fn record(&self, lateness: Duration) {
        let sample = lateness.as_secs_f64() * 1_000_000.0;
        let mut stats = self.stats.lock();
        stats.ticks += 1;
        let delta = sample - stats.mean_us;
        stats.mean_us += delta / stats.ticks as f64;
        stats.m2 += delta * (sample - stats.mean_us);
        stats.max_us = stats.max_us.max(sample);
    }

    pub fn summary(&self) -> Option<LatenessSummary> {
        let stats = *self.stats.lock();
        if stats.ticks == 0 {
            return None;
        }
        let variance = if stats.ticks > 1 {
            stats.m2 / (stats.ticks - 1) as f64
        } else {
            0.0
        };
        Some(LatenessSummary {
            ticks: stats.ticks,
            mean_us: stats.mean_us,
            std_dev_us: variance.sqrt(),
            max_us: stats.max_us,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatenessSummary {
    pub ticks: u64,
    pub mean_us: f64,
    pub std_dev_us: f64,
    pub max_us: f64,
}
