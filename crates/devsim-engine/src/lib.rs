//! ---
//! devsim_section: "04-orchestration"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Simulation orchestration engine exports."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
//! Tick-driven orchestration of telemetry sources for a fleet of simulated devices.
//!
//! A [`SimulationEngine`] owns the per-device history, the visible log stream,
//! the inference lookahead buffer, and the local physics state. Each tick it
//! reads the active device and mode and dispatches to exactly one source.

pub mod controller;
pub mod engine;
pub mod history;
pub mod log_filter;
pub mod prefetch;
pub mod registry;
pub mod scheduler;
pub mod simulated;
pub mod source;

pub use controller::{ModeController, ModeTransition, RosterChange};
pub use engine::{EngineBuilder, EngineEvent, SimulationEngine, TickOutcome};
pub use history::{AppendOutcome, HistoryStore, MAX_HISTORY};
pub use log_filter::{LogEntry, LogFilter};
pub use prefetch::{FetchTicket, PrefetchBuffer};
pub use registry::{DevicePatch, DeviceRegistry};
pub use scheduler::{RateLimiter, SchedulerHandle};
pub use simulated::{SimulatedBackend, SimulatedInference};
pub use source::{BackendClient, BatchInference, SourceError, SourceKind, TickPlan};
