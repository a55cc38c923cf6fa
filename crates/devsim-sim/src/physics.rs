//! ---
//! devsim_section: "11-simulation"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Target-seeking per-metric physics used by the local telemetry source."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::collections::HashMap;

use devsim_common::time::epoch_seconds;
use tracing::trace;

use crate::model::{Device, DeviceStatus, MetricConfig, MetricMap, Severity, SimulationStep};
use crate::random::{source_from_seed, RandomSource};

pub const DEFAULT_INERTIA: f64 = 0.1;
pub const THERMAL_INERTIA: f64 = 0.05;
pub const SPIN_DOWN_INERTIA: f64 = 0.05;
pub const POSITION_INERTIA: f64 = 0.2;

pub const BASE_NOISE: f64 = 0.02;
pub const FAULT_NOISE: f64 = 0.10;
/// Draws above this boost noise while a fault scenario is active.
pub const FAULT_NOISE_THRESHOLD: f64 = 0.8;

const FAULT_KEYWORDS: &[&str] = &["leak", "fail", "clog", "loss"];
const HIGH_LOAD_KEYWORDS: &[&str] = &["high", "fast"];
const OVERHEAT_KEYWORDS: &[&str] = &["overheat", "fire"];
const WARNING_KEYWORDS: &[&str] = &["warn"];

/// Keyword families detected in a free-text scenario label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScenarioProfile {
    pub fault: bool,
    pub high_load: bool,
    pub overheat: bool,
    pub warning: bool,
}

impl ScenarioProfile {
    pub fn classify(scenario: &str) -> Self {
        let lowered = scenario.to_lowercase();
        let any = |keywords: &[&str]| keywords.iter().any(|kw| lowered.contains(kw));
        Self {
            fault: any(FAULT_KEYWORDS),
            high_load: any(HIGH_LOAD_KEYWORDS),
            overheat: any(OVERHEAT_KEYWORDS),
            warning: any(WARNING_KEYWORDS),
        }
    }

    pub fn severity(&self) -> Severity {
        if self.fault {
            Severity::Critical
        } else if self.high_load || self.overheat || self.warning {
            Severity::Warning
        } else {
            Severity::Info
        }
    }
}

/// Value a metric is pulled towards and how strongly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub value: f64,
    pub inertia: f64,
}

/// Resolve the target for one metric. `t_seconds` is wall-clock time.
pub fn resolve_target(
    metric: &MetricConfig,
    status: DeviceStatus,
    profile: ScenarioProfile,
    t_seconds: f64,
) -> Target {
    if status == DeviceStatus::Stopped {
        return Target {
            value: metric.min,
            inertia: SPIN_DOWN_INERTIA,
        };
    }

    let id = metric.id.to_lowercase();
    if id.contains("rpm") || id.contains("current") {
        let share = if profile.high_load { 0.9 } else { 0.7 };
        let mut value = metric.max * share;
        if profile.fault {
            value *= 0.5;
        }
        Target {
            value,
            inertia: DEFAULT_INERTIA,
        }
    } else if id.contains("temp") || id.contains("heat") {
        let value = if profile.overheat {
            metric.max
        } else if profile.high_load {
            metric.max * 0.8
        } else {
            metric.midpoint()
        };
        Target {
            value,
            inertia: THERMAL_INERTIA,
        }
    } else if id == "x_pos" {
        Target {
            value: ((t_seconds.sin() + 1.0) / 2.0) * metric.max,
            inertia: POSITION_INERTIA,
        }
    } else {
        Target {
            value: metric.midpoint(),
            inertia: DEFAULT_INERTIA,
        }
    }
}

/// Stateful per-device generator. Each instance owns its own state, so separate
/// engines never share values.
#[derive(Debug)]
pub struct PhysicsModel {
    state: HashMap<String, MetricMap>,
    rng: Box<dyn RandomSource>,
}

impl PhysicsModel {
    pub fn new(rng: Box<dyn RandomSource>) -> Self {
        Self {
            state: HashMap::new(),
            rng,
        }
    }

    pub fn seeded(seed: Option<u64>) -> Self {
        Self::new(source_from_seed(seed))
    }

    /// Advance every metric of `device` by one tick and return the resulting step.
    pub fn generate(&mut self, device: &Device, timestamp_ms: i64) -> SimulationStep {
        let profile = ScenarioProfile::classify(&device.current_scenario);
        let t_seconds = epoch_seconds(timestamp_ms);
        let Self { state, rng } = self;
        let values = state.entry(device.id.clone()).or_default();

        let mut metrics = MetricMap::with_capacity(device.metrics.len());
        for metric in &device.metrics {
            let current = values.get(&metric.id).copied().unwrap_or(metric.min);
            let target = resolve_target(metric, device.status, profile, t_seconds);
            let noise_factor =
                if device.is_running() && profile.fault && rng.next_f64() > FAULT_NOISE_THRESHOLD {
                    FAULT_NOISE
                } else {
                    BASE_NOISE
                };
            let noise = (rng.next_f64() - 0.5) * metric.range() * noise_factor;
            let next = metric.clamp(current + (target.value - current) * target.inertia + noise);
            values.insert(metric.id.clone(), next);
            metrics.insert(metric.id.clone(), next);
        }

        let (message, severity) = describe(device, profile);
        trace!(device = %device.id, status = %device.status, ?profile, "physics step generated");
        SimulationStep::new(timestamp_ms, metrics).with_log(message, severity)
    }

    /// Seed state from a sample produced elsewhere so the next local step continues from it.
    pub fn observe(&mut self, device_id: &str, metrics: &MetricMap) {
        let values = self.state.entry(device_id.to_owned()).or_default();
        for (id, value) in metrics {
            if value.is_finite() {
                values.insert(id.clone(), *value);
            }
        }
    }

    /// Forget a device so its next step starts cold from every metric's minimum.
    pub fn reset(&mut self, device_id: &str) {
        self.state.remove(device_id);
    }

    pub fn state(&self, device_id: &str) -> Option<&MetricMap> {
        self.state.get(device_id)
    }
}

fn describe(device: &Device, profile: ScenarioProfile) -> (String, Severity) {
    if !device.is_running() {
        return ("Device stopped".to_owned(), Severity::Info);
    }
    let scenario = device.current_scenario.trim();
    if scenario.is_empty() {
        return ("Operating normally".to_owned(), Severity::Info);
    }
    (format!("Operating under {}", scenario), profile.severity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricConfig;
    use crate::random::{FixedRandom, SeededRandom, SequenceRandom};

    fn quiet() -> PhysicsModel {
        PhysicsModel::new(Box::new(FixedRandom(0.5)))
    }

    fn device(metric: MetricConfig, running: bool, scenario: &str) -> Device {
        let status = if running {
            DeviceStatus::Running
        } else {
            DeviceStatus::Stopped
        };
        Device::new("dev-1", "Device 1")
            .with_status(status)
            .with_scenario(scenario)
            .with_metric(metric)
    }

    #[test]
    fn high_load_temperature_moves_towards_eighty_percent() {
        let mut model = quiet();
        let dev = device(MetricConfig::new("temp", 0.0, 100.0), true, "High Load");
        let step = model.generate(&dev, 0);
        assert!((step.metrics["temp"] - 4.0).abs() < 1e-9);
        assert_eq!(step.severity, Severity::Warning);
        assert_eq!(step.log_message.as_deref(), Some("Operating under High Load"));
    }

    #[test]
    fn rpm_target_depends_on_load_and_faults() {
        let cases = [
            ("Normal", 70.0),
            ("Fast cycle", 90.0),
            ("Bearing failure", 35.0),
            ("High speed leak", 45.0),
        ];
        for (scenario, expected) in cases {
            let mut model = quiet();
            let dev = device(MetricConfig::new("motor_rpm", 0.0, 1000.0), true, scenario);
            let value = model.generate(&dev, 0).metrics["motor_rpm"];
            assert!(
                (value - expected).abs() < 1e-9,
                "scenario {scenario}: expected {expected}, got {value}"
            );
        }
    }

    #[test]
    fn overheat_targets_maximum_temperature() {
        let mut model = quiet();
        let dev = device(MetricConfig::new("coil_heat", 0.0, 200.0), true, "Overheat");
        let value = model.generate(&dev, 0).metrics["coil_heat"];
        assert!((value - 10.0).abs() < 1e-9);
    }

    #[test]
    fn x_pos_follows_a_sinusoid_with_fast_inertia() {
        let mut model = quiet();
        let dev = device(MetricConfig::new("x_pos", 0.0, 100.0), true, "");
        // sin(0) = 0, so the target is max / 2.
        let value = model.generate(&dev, 0).metrics["x_pos"];
        assert!((value - 10.0).abs() < 1e-9);
    }

    #[test]
    fn fault_noise_boost_applies_above_threshold() {
        let metric = MetricConfig::new("pressure", 0.0, 100.0);
        let mut boosted = PhysicsModel::new(Box::new(FixedRandom(0.9)));
        let leak = device(metric.clone(), true, "Coolant Leak");
        assert!((boosted.generate(&leak, 0).metrics["pressure"] - 9.0).abs() < 1e-9);

        let mut plain = PhysicsModel::new(Box::new(FixedRandom(0.9)));
        let normal = device(metric, true, "Normal");
        assert!((plain.generate(&normal, 0).metrics["pressure"] - 5.8).abs() < 1e-9);
    }

    #[test]
    fn fault_scenarios_are_critical() {
        let mut model = quiet();
        let dev = device(MetricConfig::new("flow", 0.0, 10.0), true, "Filter CLOG");
        assert_eq!(model.generate(&dev, 0).severity, Severity::Critical);
    }

    #[test]
    fn stopped_device_reports_info_and_spins_down() {
        let mut model = quiet();
        let metric = MetricConfig::new("rpm", 100.0, 3000.0);
        let dev = device(metric.clone(), false, "High Load");
        let mut seed = MetricMap::new();
        seed.insert("rpm".into(), 3000.0);
        model.observe(&dev.id, &seed);

        let mut previous = 3000.0;
        for tick in 0..300 {
            let step = model.generate(&dev, tick * 1000);
            let value = step.metrics["rpm"];
            assert!(value <= previous, "tick {tick}: {value} > {previous}");
            assert!(value >= metric.min);
            assert_eq!(step.log_message.as_deref(), Some("Device stopped"));
            assert_eq!(step.severity, Severity::Info);
            previous = value;
        }
        assert!((previous - metric.min).abs() < 0.01);
    }

    #[test]
    fn values_stay_within_bounds_for_any_scenario_and_draw() {
        let scenarios = [
            "",
            "High Load",
            "Coolant leak",
            "FAST overheat with pressure loss",
            "fire",
            "warn: clogged filter",
            "idle",
        ];
        let metrics = [
            MetricConfig::new("rpm", 0.0, 3000.0),
            MetricConfig::new("current", -5.0, 5.0),
            MetricConfig::new("temp", 20.0, 90.0),
            MetricConfig::new("x_pos", 0.0, 50.0),
            MetricConfig::new("pressure", 1.0, 1.0),
            MetricConfig::new("vibration", 0.0, 0.5),
        ];
        let sources: Vec<Box<dyn RandomSource>> = vec![
            Box::new(SequenceRandom::new(vec![0.0, 0.999_999, 0.81, 0.2])),
            Box::new(FixedRandom(0.999_999)),
            Box::new(FixedRandom(0.0)),
            Box::new(SeededRandom::new(7)),
        ];
        for rng in sources {
            let mut model = PhysicsModel::new(rng);
            for (i, scenario) in scenarios.iter().enumerate() {
                let mut dev = Device::new("bounded", "Bounded").with_scenario(*scenario);
                dev.metrics = metrics.to_vec();
                for tick in 0..200i64 {
                    dev.status = if (tick + i as i64) % 37 < 30 {
                        DeviceStatus::Running
                    } else {
                        DeviceStatus::Stopped
                    };
                    let step = model.generate(&dev, tick * 997);
                    for metric in &dev.metrics {
                        let value = step.metrics[&metric.id];
                        assert!(
                            value >= metric.min && value <= metric.max,
                            "{} = {} outside [{}, {}]",
                            metric.id,
                            value,
                            metric.min,
                            metric.max
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn state_persists_until_reset() {
        let mut model = quiet();
        let dev = device(MetricConfig::new("level", 0.0, 100.0), true, "");
        let first = model.generate(&dev, 0).metrics["level"];
        let second = model.generate(&dev, 1000).metrics["level"];
        assert!((first - 5.0).abs() < 1e-9);
        assert!((second - 9.5).abs() < 1e-9);

        model.reset(&dev.id);
        assert!(model.state(&dev.id).is_none());
        let cold = model.generate(&dev, 2000).metrics["level"];
        assert!((cold - 5.0).abs() < 1e-9);
    }

    #[test]
    fn observed_values_seed_the_next_step() {
        let mut model = quiet();
        let dev = device(MetricConfig::new("level", 0.0, 100.0), true, "");
        let mut seen = MetricMap::new();
        seen.insert("level".into(), 50.0);
        seen.insert("bogus".into(), f64::NAN);
        model.observe(&dev.id, &seen);
        assert!(!model.state(&dev.id).unwrap().contains_key("bogus"));
        let value = model.generate(&dev, 0).metrics["level"];
        assert!((value - 50.0).abs() < 1e-9);
    }
}
