//! ---
//! devsim_section: "11-simulation"
//! devsim_subsection: "01-bootstrap"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Simulation model module exports and shared types."
//! devsim_version: "v0.1.0"
//! devsim_owner: "tbd"
//! ---
//! Device model, local physics and backend waveforms for devsim.

pub mod generator;
pub mod model;
pub mod physics;
pub mod random;

pub use generator::{Reading, SignalGenerator};
pub use model::{
    BatchItem, Device, DeviceStatus, MetricConfig, MetricMap, Severity, SimulationBatch,
    SimulationStep,
};
pub use physics::{resolve_target, PhysicsModel, ScenarioProfile, Target};
pub use random::{source_from_seed, FixedRandom, RandomSource, SeededRandom, SequenceRandom};
