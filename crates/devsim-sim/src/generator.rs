//! ---
//! devsim_section: "11-simulation"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Per-metric waveform generators with noise and anomaly injection for the simulated backend."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::f64::consts::PI;

use devsim_common::config::{AnomalyKind, GenerationMode, GeneratorConfig};
use rand::prelude::*;
use rand_distr::Normal;
use tracing::trace;

use crate::model::{Device, MetricConfig, Severity, SimulationStep};

/// One generated value and the anomaly applied to it, if any.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub anomaly: Option<AnomalyKind>,
}

#[derive(Debug, Clone, Copy)]
struct Channel {
    current: f64,
    step: f64,
    phase: u64,
}

/// Stateful waveform source keyed by device and metric.
#[derive(Debug)]
pub struct SignalGenerator {
    rng: StdRng,
    channels: HashMap<String, HashMap<String, Channel>>,
}

impl SignalGenerator {
    pub fn new(rng: StdRng) -> Self {
        Self {
            rng,
            channels: HashMap::new(),
        }
    }

    pub fn seeded(seed: Option<u64>) -> Self {
        Self::new(match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        })
    }

    /// Advance one channel by a single sample.
    pub fn next_reading(
        &mut self,
        device_id: &str,
        metric: &MetricConfig,
        config: &GeneratorConfig,
    ) -> Reading {
        let channel = self
            .channels
            .entry(device_id.to_owned())
            .or_default()
            .entry(metric.id.clone())
            .or_insert_with(|| Channel {
                current: config.initial.unwrap_or(metric.min),
                step: config.step,
                phase: 0,
            });

        let base = match config.mode {
            GenerationMode::Random => metric.min + self.rng.gen::<f64>() * metric.range(),
            GenerationMode::Linear => {
                let mut next = channel.current + channel.step;
                if next > metric.max || next < metric.min {
                    channel.step = -channel.step;
                    next = channel.current + channel.step;
                }
                channel.current = next;
                next
            }
            GenerationMode::Periodic => {
                let period = if config.period > 0.0 {
                    config.period
                } else {
                    100.0
                };
                let amplitude = config.amplitude.unwrap_or(metric.range() / 2.0);
                let offset = config.offset.unwrap_or(metric.midpoint());
                let value = offset + amplitude * (2.0 * PI * channel.phase as f64 / period).sin();
                channel.phase += 1;
                value
            }
            GenerationMode::RandomWalk => {
                let half_width = config.step_range.unwrap_or_else(|| {
                    if metric.range() != 0.0 {
                        metric.range().abs() * 0.01
                    } else {
                        1.0
                    }
                });
                let change = (self.rng.gen::<f64>() * 2.0 - 1.0) * half_width;
                channel.current = metric.clamp(channel.current + change);
                channel.current
            }
        };

        let noisy = match Normal::new(0.0, config.noise_sigma) {
            Ok(noise) if config.noise_sigma > 0.0 => base + noise.sample(&mut self.rng),
            _ => base,
        };

        if config.anomaly_rate > 0.0 && self.rng.gen::<f64>() < config.anomaly_rate {
            let value = match config.anomaly_type {
                AnomalyKind::Spike => noisy * config.anomaly_multiplier,
                AnomalyKind::Drop => 0.0,
                AnomalyKind::Min => metric.min,
                AnomalyKind::Max => metric.max,
            };
            trace!(device = device_id, metric = %metric.id, kind = config.anomaly_type.as_str(), "anomaly injected");
            return Reading {
                value,
                anomaly: Some(config.anomaly_type),
            };
        }
        Reading {
            value: noisy,
            anomaly: None,
        }
    }

    /// Replace every metric of `step` that has a generator configured. Any
    /// injected anomaly raises the step to at least a warning.
    pub fn overlay(&mut self, device: &Device, mut step: SimulationStep) -> SimulationStep {
        let mut anomalies = Vec::new();
        for metric in &device.metrics {
            let Some(config) = &metric.generator else {
                continue;
            };
            let reading = self.next_reading(&device.id, metric, config);
            step.metrics.insert(metric.id.clone(), reading.value);
            if let Some(kind) = reading.anomaly {
                anomalies.push(format!("{} {}", kind.as_str(), metric.id));
            }
        }
        if !anomalies.is_empty() && step.severity != Severity::Critical {
            step = step.with_log(
                format!("Anomaly detected: {}", anomalies.join(", ")),
                Severity::Warning,
            );
        }
        step
    }

    pub fn reset(&mut self, device_id: &str) {
        self.channels.remove(device_id);
    }
}
