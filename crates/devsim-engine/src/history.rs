//! ---
//! devsim_section: "04-orchestration"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Bounded, deduplicated telemetry history for the active device."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::collections::VecDeque;

use devsim_sim::{MetricMap, SimulationStep};

pub const MAX_HISTORY: usize = 60;

/// Result of offering a step to the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Same timestamp as the newest stored step.
    Duplicate,
    /// Older than the newest stored step.
    Stale,
}

impl AppendOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendOutcome::Appended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppendOutcome::Appended => "appended",
            AppendOutcome::Duplicate => "duplicate",
            AppendOutcome::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    steps: VecDeque<SimulationStep>,
    capacity: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(MAX_HISTORY)
    }
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            steps: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `step` unless its timestamp does not advance past the newest one.
    ///
    /// A step carrying the newest timestamp is dropped even when its values
    /// differ. Older steps are dropped as well so timestamps never go backwards.
    pub fn append(&mut self, step: SimulationStep) -> AppendOutcome {
        if let Some(last) = self.steps.back() {
            if step.timestamp == last.timestamp {
                return AppendOutcome::Duplicate;
            }
            if step.timestamp < last.timestamp {
                return AppendOutcome::Stale;
            }
        }
        self.steps.push_back(step);
        while self.steps.len() > self.capacity {
            self.steps.pop_front();
        }
        AppendOutcome::Appended
    }

    pub fn reset(&mut self) {
        self.steps.clear();
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&SimulationStep> {
        self.steps.back()
    }

    /// Metrics of the newest step, sent to batch inference as a continuity hint.
    pub fn last_metrics(&self) -> Option<&MetricMap> {
        self.steps.back().map(|step| &step.metrics)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SimulationStep> {
        self.steps.iter()
    }

    pub fn snapshot(&self) -> Vec<SimulationStep> {
        self.steps.iter().cloned().collect()
    }
}
