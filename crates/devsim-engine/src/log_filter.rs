//! ---
//! devsim_section: "04-orchestration"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Sampling filter that turns telemetry steps into visible log entries."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::collections::VecDeque;

use devsim_sim::{RandomSource, Severity, SimulationStep};
use serde::{Deserialize, Serialize};

pub const DEFAULT_INFO_SAMPLE_RATE: f64 = 0.2;
pub const DEFAULT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: i64,
    pub device_id: String,
    pub message: String,
    pub severity: Severity,
}

/// Warnings and critical messages always pass; info messages are sampled.
#[derive(Debug)]
pub struct LogFilter {
    rng: Box<dyn RandomSource>,
    info_sample_rate: f64,
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogFilter {
    pub fn new(rng: Box<dyn RandomSource>, info_sample_rate: f64, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            rng,
            info_sample_rate: info_sample_rate.clamp(0.0, 1.0),
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Offer an appended step; returns the entry when it became visible.
    pub fn maybe_append(&mut self, device_id: &str, step: &SimulationStep) -> Option<LogEntry> {
        let message = step.log_text()?;
        if step.severity == Severity::Info && self.rng.next_f64() >= self.info_sample_rate {
            return None;
        }
        let entry = LogEntry {
            timestamp: step.timestamp,
            device_id: device_id.to_owned(),
            message: message.to_owned(),
            severity: step.severity,
        };
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        Some(entry)
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}
