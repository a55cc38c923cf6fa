//! ---
//! devsim_section: "05-external-interfaces"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "In-process backend and inference collaborators."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use devsim_common::time::{epoch_millis_now, quantize_millis};
use devsim_common::{BackendConfig, InferenceConfig};
use devsim_sim::{
    source_from_seed, BatchItem, Device, MetricMap, PhysicsModel, RandomSource, SignalGenerator,
    SimulationBatch, SimulationStep,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::registry::DeviceRegistry;
use crate::source::{BackendClient, BatchInference, SourceError};

/// Serves the roster and per-device samples from a [`DeviceRegistry`].
///
/// Metrics with a generator configured follow that waveform, with its noise
/// and anomalies. The rest follow physics. Sample timestamps are rounded down
/// to the sampling period, so polling more often than the period yields
/// repeated timestamps.
#[derive(Debug)]
pub struct SimulatedBackend {
    registry: DeviceRegistry,
    physics: Mutex<PhysicsModel>,
    signals: Mutex<SignalGenerator>,
    sampling_period: Duration,
}

impl SimulatedBackend {
    pub fn new(registry: DeviceRegistry, config: &BackendConfig, seed: Option<u64>) -> Self {
        Self {
            registry,
            physics: Mutex::new(PhysicsModel::seeded(seed)),
            signals: Mutex::new(SignalGenerator::seeded(seed.map(|seed| seed.rotate_left(29)))),
            sampling_period: config.sampling_period,
        }
    }

    pub fn sample_at(&self, device_id: &str, timestamp_ms: i64) -> Option<SimulationStep> {
        let device = self.registry.device(device_id)?;
        let timestamp = quantize_millis(timestamp_ms, self.sampling_period);
        let step = self.physics.lock().generate(&device, timestamp);
        Some(self.signals.lock().overlay(&device, step))
    }
}

#[async_trait]
impl BackendClient for SimulatedBackend {
    async fn fetch_devices(&self) -> Result<Vec<Device>, SourceError> {
        Ok(self.registry.devices())
    }

    async fn fetch_device_data(
        &self,
        device_id: &str,
    ) -> Result<Option<SimulationStep>, SourceError> {
        let step = self.sample_at(device_id, epoch_millis_now());
        trace!(device = device_id, found = step.is_some(), "simulated backend sample");
        Ok(step)
    }
}

/// Produces batches by running local physics ahead of time from the continuity hint.
#[derive(Debug)]
pub struct SimulatedInference {
    physics: Mutex<PhysicsModel>,
    failures: Mutex<Box<dyn RandomSource>>,
    batch_size: usize,
    failure_probability: f64,
    spacing: Duration,
}

impl SimulatedInference {
    /// `spacing` is the gap between predicted steps; pass the engine tick interval.
    pub fn new(config: &InferenceConfig, spacing: Duration, seed: Option<u64>) -> Self {
        Self {
            physics: Mutex::new(PhysicsModel::seeded(seed)),
            failures: Mutex::new(source_from_seed(seed.map(|seed| !seed))),
            batch_size: config.batch_size,
            failure_probability: config.failure_probability,
            spacing,
        }
    }

    pub fn with_failure_source(mut self, source: Box<dyn RandomSource>) -> Self {
        self.failures = Mutex::new(source);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Steps are predicted for `base_ms + k * spacing`, k = 1..=batch_size.
    fn predict(
        &self,
        device: &Device,
        last_metrics: Option<&MetricMap>,
        base_ms: i64,
    ) -> SimulationBatch {
        let mut physics = self.physics.lock();
        physics.reset(&device.id);
        if let Some(last) = last_metrics {
            physics.observe(&device.id, last);
        }
        let spacing = self.spacing.as_millis() as i64;
        let batch = (1..=self.batch_size as i64)
            .map(|k| {
                let step = physics.generate(device, base_ms + k * spacing);
                BatchItem {
                    metrics: step.metrics,
                    log_message: step.log_message,
                    severity: step.severity,
                }
            })
            .collect();
        SimulationBatch { batch }
    }
}

#[async_trait]
impl BatchInference for SimulatedInference {
    async fn fetch_simulation_batch(
        &self,
        device: &Device,
        last_metrics: Option<&MetricMap>,
    ) -> Result<Option<SimulationBatch>, SourceError> {
        let draw = self.failures.lock().next_f64();
        if draw < self.failure_probability {
            debug!(device = %device.id, "simulated inference failure injected");
            return Err(SourceError::Unavailable(
                "simulated inference failure".to_owned(),
            ));
        }
        if self.batch_size == 0 {
            return Ok(None);
        }
        Ok(Some(self.predict(device, last_metrics, epoch_millis_now())))
    }
}
