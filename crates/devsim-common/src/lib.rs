//! ---
//! devsim_section: "01-core-functionality"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Shared primitives and utilities for the simulation runtime."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
//! Core shared primitives for the devsim workspace.
//! Configuration loading, tracing setup, clock helpers and tick lateness
//! tracking used across the workspace.

pub mod config;
pub mod logging;
pub mod time;
pub mod timing;

pub use config::{
    AnomalyKind, AppConfig, BackendConfig, DeviceConfig, EngineConfig, GenerationMode,
    GeneratorConfig, InferenceConfig, LoadedAppConfig, LoggingConfig, MetricConfigEntry,
    MetricsConfig, Mode,
};
pub use logging::{init_tracing, LogFormat};
pub use timing::{LatenessSummary, TickLateness};
