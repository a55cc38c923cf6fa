//! ---
//! devsim_section: "05-external-interfaces"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Collaborator contracts for backend polling and batch inference."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use devsim_common::Mode;
use devsim_sim::{Device, MetricMap, SimulationBatch, SimulationStep};
use serde::Serialize;

/// Errors surfaced by remote collaborators. None of them are fatal to the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    /// The collaborator could not be reached or refused the request.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// No answer within the configured remote timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The collaborator answered with something that could not be used.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Live device data served by the backend.
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    async fn fetch_devices(&self) -> Result<Vec<Device>, SourceError>;

    /// Latest sample for one device. `None` when the backend has nothing to report.
    async fn fetch_device_data(&self, device_id: &str)
        -> Result<Option<SimulationStep>, SourceError>;
}

/// Remote model producing a sequence of future steps.
///
/// Calls are idempotent, so a failed request may simply be issued again on a
/// later tick.
#[async_trait]
pub trait BatchInference: Send + Sync + 'static {
    async fn fetch_simulation_batch(
        &self,
        device: &Device,
        last_metrics: Option<&MetricMap>,
    ) -> Result<Option<SimulationBatch>, SourceError>;
}

/// Which adapter produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Inference,
    Backend,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Local => "local",
            SourceKind::Inference => "inference",
            SourceKind::Backend => "backend",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work decided for one tick from the live mode and device snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPlan {
    /// No active device, or the device is missing from the roster.
    Idle,
    /// Backend mode with a stopped device.
    Skip,
    Local,
    /// Consume the lookahead queue, falling back to local physics when empty.
    Buffered,
    /// Request one live sample from the backend.
    Poll,
}

impl TickPlan {
    pub fn resolve(mode: Mode, device: Option<&Device>) -> Self {
        let Some(device) = device else {
            return TickPlan::Idle;
        };
        match (mode, device.is_running()) {
            (Mode::Backend, true) => TickPlan::Poll,
            (Mode::Backend, false) => TickPlan::Skip,
            (Mode::Ai, true) => TickPlan::Buffered,
            (Mode::Ai, false) | (Mode::Local, _) => TickPlan::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TickPlan::Idle => "idle",
            TickPlan::Skip => "skip",
            TickPlan::Local => "local",
            TickPlan::Buffered => "buffered",
            TickPlan::Poll => "poll",
        }
    }
}
