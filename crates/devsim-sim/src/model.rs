//! ---
//! devsim_section: "11-simulation"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Device, metric, and telemetry step types shared by all sources."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::fmt;

use devsim_common::config::{DeviceConfig, GeneratorConfig, MetricConfigEntry};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Metric readings keyed by metric id, in device declaration order.
pub type MetricMap = IndexMap<String, f64>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Running,
    #[default]
    Stopped,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Running => "running",
            DeviceStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric channel exposed by a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    pub min: f64,
    pub max: f64,
    /// Backend waveform. Ignored by local physics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<GeneratorConfig>,
}

impl MetricConfig {
    pub fn new(id: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            id: id.into(),
            name: None,
            unit: None,
            min,
            max,
            generator: None,
        }
    }

    pub fn with_generator(mut self, generator: GeneratorConfig) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    /// Clamp into `[min, max]` without panicking on inverted or NaN bounds.
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            return self.min;
        }
        value.max(self.min).min(self.max)
    }
}

impl From<&MetricConfigEntry> for MetricConfig {
    fn from(entry: &MetricConfigEntry) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            unit: entry.unit.clone(),
            min: entry.min,
            max: entry.max,
            generator: entry.generator.clone(),
        }
    }
}

/// Snapshot of a device as held by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub current_scenario: String,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: String::new(),
            description: None,
            status: DeviceStatus::Stopped,
            current_scenario: String::new(),
            metrics: Vec::new(),
        }
    }

    pub fn from_config(id: &str, config: &DeviceConfig) -> Self {
        Self {
            id: id.to_owned(),
            name: config.name.clone(),
            kind: config.kind.clone(),
            description: config.description.clone(),
            status: if config.running {
                DeviceStatus::Running
            } else {
                DeviceStatus::Stopped
            },
            current_scenario: config.scenario.clone(),
            metrics: config.metrics.iter().map(MetricConfig::from).collect(),
        }
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.current_scenario = scenario.into();
        self
    }

    pub fn with_metric(mut self, metric: MetricConfig) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == DeviceStatus::Running
    }

    pub fn metric(&self, id: &str) -> Option<&MetricConfig> {
        self.metrics.iter().find(|metric| metric.id == id)
    }
}

/// One telemetry sample for a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimulationStep {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub metrics: MetricMap,
    #[serde(default)]
    pub log_message: Option<String>,
    #[serde(default)]
    pub severity: Severity,
}

impl SimulationStep {
    pub fn new(timestamp: i64, metrics: MetricMap) -> Self {
        Self {
            timestamp,
            metrics,
            log_message: None,
            severity: Severity::Info,
        }
    }

    pub fn with_log(mut self, message: impl Into<String>, severity: Severity) -> Self {
        self.log_message = Some(message.into());
        self.severity = severity;
        self
    }

    /// Replace the timestamp of a step taken out of a lookahead buffer.
    pub fn restamped(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The log message when present and not blank.
    pub fn log_text(&self) -> Option<&str> {
        self.log_message
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
    }
}

/// Single future step returned by batch inference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub metrics: MetricMap,
    #[serde(default)]
    pub log_message: Option<String>,
    #[serde(default)]
    pub severity: Severity,
}

/// Ordered lookahead returned by batch inference.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SimulationBatch {
    pub batch: Vec<BatchItem>,
}

impl SimulationBatch {
    /// Convert into steps stamped `base + k * spacing_ms` for the k-th item, starting at k = 1.
    pub fn into_steps(self, base_timestamp: i64, spacing_ms: i64) -> Vec<SimulationStep> {
        self.batch
            .into_iter()
            .zip(1i64..)
            .map(|(item, k)| SimulationStep {
                timestamp: base_timestamp + k * spacing_ms,
                metrics: item.metrics,
                log_message: item.log_message,
                severity: item.severity,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}
