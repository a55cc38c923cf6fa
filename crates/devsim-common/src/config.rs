//! ---
//! devsim_section: "01-core-functionality"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Shared primitives and utilities for the simulation runtime."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_mode() -> Mode {
    Mode::Local
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_roster_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_history_capacity() -> usize {
    60
}

fn default_prefetch_low_water() -> usize {
    5
}

fn default_info_log_sample_rate() -> f64 {
    0.2
}

fn default_log_capacity() -> usize {
    100
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_batch_size() -> usize {
    5
}

fn default_sampling_period() -> Duration {
    Duration::from_millis(1000)
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

/// Primary configuration object for the simulator daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Seed fleet loaded into the device registry at startup.
    #[serde(default)]
    pub devices: IndexMap<String, DeviceConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "DEVSIM_CONFIG";

    /// Load configuration from disk, respecting the `DEVSIM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate engine tunables. Device definitions are accepted as-is.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.inference.validate()?;
        if let Some(active) = &self.engine.active_device {
            if !self.devices.is_empty() && !self.devices.contains_key(active) {
                return Err(anyhow!(
                    "engine.active_device '{}' is not declared under [devices]",
                    active
                ));
            }
        }
        Ok(())
    }

    /// Device that should be active at startup: the configured one, else the first declared.
    pub fn initial_device(&self) -> Option<String> {
        self.engine
            .active_device
            .clone()
            .or_else(|| self.devices.keys().next().cloned())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Telemetry source selected for the active device.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Remote batch inference with local fallback.
    Ai,
    #[default]
    Local,
    /// One live sample per tick from the backend.
    Backend,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Ai => "ai",
            Mode::Local => "local",
            Mode::Backend => "backend",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ai" => Ok(Mode::Ai),
            "local" => Ok(Mode::Local),
            "backend" => Ok(Mode::Backend),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub active_device: Option<String>,
    #[serde(default = "default_tick_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde(default = "default_roster_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub roster_interval: Duration,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_prefetch_low_water")]
    pub prefetch_low_water: usize,
    #[serde(default = "default_info_log_sample_rate")]
    pub info_log_sample_rate: f64,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_remote_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub remote_timeout: Duration,
    /// Seed for the physics and log-sampling random sources. Unset means entropy-seeded.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            active_device: None,
            tick_interval: default_tick_interval(),
            roster_interval: default_roster_interval(),
            history_capacity: default_history_capacity(),
            prefetch_low_water: default_prefetch_low_water(),
            info_log_sample_rate: default_info_log_sample_rate(),
            log_capacity: default_log_capacity(),
            remote_timeout: default_remote_timeout(),
            random_seed: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(anyhow!("engine.tick_interval must be greater than zero"));
        }
        if self.roster_interval.is_zero() {
            return Err(anyhow!("engine.roster_interval must be greater than zero"));
        }
        if self.history_capacity == 0 {
            return Err(anyhow!("engine.history_capacity must be at least 1"));
        }
        if self.log_capacity == 0 {
            return Err(anyhow!("engine.log_capacity must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.info_log_sample_rate) {
            return Err(anyhow!(
                "engine.info_log_sample_rate must be within [0, 1], got {}",
                self.info_log_sample_rate
            ));
        }
        Ok(())
    }

    /// Seed used for the physics model random source.
    pub fn physics_seed(&self) -> Option<u64> {
        self.random_seed
    }

    /// Seed used for the log sampler, derived so both streams stay independent.
    pub fn log_seed(&self) -> Option<u64> {
        self.random_seed.map(|seed| seed.rotate_left(17) ^ 0x5EED)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Probability that a simulated inference call fails. Used to exercise fallback paths.
    #[serde(default)]
    pub failure_probability: f64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            failure_probability: 0.0,
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("inference.batch_size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.failure_probability) {
            return Err(anyhow!(
                "inference.failure_probability must be within [0, 1], got {}",
                self.failure_probability
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Server-side sampling period; sample timestamps are quantised to it.
    #[serde(default = "default_sampling_period")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sampling_period: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            sampling_period: default_sampling_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `DEVSIM_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Directory for the rolling JSON log. Console only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Seed definition of a simulated device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub metrics: Vec<MetricConfigEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricConfigEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    pub min: f64,
    pub max: f64,
    /// Waveform served by the simulated backend. Unset metrics follow local physics.
    #[serde(default)]
    pub generator: Option<GeneratorConfig>,
}

/// How the simulated backend produces successive values of a metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Uniform draw within `[min, max]`.
    #[default]
    Random,
    /// Constant step that reverses direction at the bounds.
    Linear,
    /// Sine wave over `period` samples.
    Periodic,
    /// Uniform step within `±step_range`, clamped to the bounds.
    RandomWalk,
}

/// Value substituted when an anomaly fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyKind {
    /// Multiply by `anomaly_multiplier`.
    #[default]
    Spike,
    /// Zero.
    Drop,
    Min,
    Max,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Spike => "spike",
            AnomalyKind::Drop => "drop",
            AnomalyKind::Min => "min",
            AnomalyKind::Max => "max",
        }
    }
}

fn default_linear_step() -> f64 {
    1.0
}

fn default_period() -> f64 {
    100.0
}

fn default_anomaly_multiplier() -> f64 {
    1.5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub mode: GenerationMode,
    /// Starting value for linear and random-walk modes. Defaults to the metric minimum.
    #[serde(default)]
    pub initial: Option<f64>,
    #[serde(default = "default_linear_step")]
    pub step: f64,
    /// Random-walk half width. Defaults to 1% of the metric range.
    #[serde(default)]
    pub step_range: Option<f64>,
    /// Samples per sine cycle.
    #[serde(default = "default_period")]
    pub period: f64,
    /// Defaults to half the metric range.
    #[serde(default)]
    pub amplitude: Option<f64>,
    /// Defaults to the metric midpoint.
    #[serde(default)]
    pub offset: Option<f64>,
    /// Standard deviation of additive gaussian noise. Zero disables noise.
    #[serde(default)]
    pub noise_sigma: f64,
    /// Per-sample anomaly probability in `[0, 1]`.
    #[serde(default)]
    pub anomaly_rate: f64,
    #[serde(default)]
    pub anomaly_type: AnomalyKind,
    #[serde(default = "default_anomaly_multiplier")]
    pub anomaly_multiplier: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            mode: GenerationMode::default(),
            initial: None,
            step: default_linear_step(),
            step_range: None,
            period: default_period(),
            amplitude: None,
            offset: None,
            noise_sigma: 0.0,
            anomaly_rate: 0.0,
            anomaly_type: AnomalyKind::default(),
            anomaly_multiplier: default_anomaly_multiplier(),
        }
    }
}

impl GeneratorConfig {
    pub fn new(mode: GenerationMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
        [engine]
        mode = "ai"
        active_device = "pump-01"
        tick_interval = 250
        random_seed = 7

        [inference]
        batch_size = 3

        [devices.pump-01]
        name = "Coolant Pump"
        type = "pump"
        running = true
        scenario = "Coolant Leak"
        metrics = [
            { id = "rpm", min = 0.0, max = 3000.0, unit = "rpm" },
            { id = "temp", min = 0.0, max = 120.0 },
        ]

        [devices.press-02]
        name = "Hydraulic Press"
    "#;

    #[test]
    fn parses_engine_and_device_sections() {
        let config: AppConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.engine.mode, Mode::Ai);
        assert_eq!(config.engine.tick_interval, Duration::from_millis(250));
        assert_eq!(config.engine.roster_interval, Duration::from_secs(5));
        assert_eq!(config.engine.history_capacity, 60);
        assert_eq!(config.inference.batch_size, 3);
        let pump = &config.devices["pump-01"];
        assert_eq!(pump.kind, "pump");
        assert!(pump.running);
        assert_eq!(pump.metrics.len(), 2);
        assert_eq!(pump.metrics[0].unit.as_deref(), Some("rpm"));
        assert_eq!(config.initial_device().as_deref(), Some("pump-01"));
    }

    #[test]
    fn metric_generators_parse_with_defaults() {
        let config: AppConfig = r#"
            [devices.fan]
            name = "Fan"
            metrics = [
                { id = "rpm", min = 0.0, max = 1000.0, generator = { mode = "periodic", period = 60, noise_sigma = 2.5 } },
                { id = "temp", min = 10.0, max = 90.0, generator = { mode = "random_walk", anomaly_rate = 0.01, anomaly_type = "max" } },
                { id = "load", min = 0.0, max = 1.0 },
            ]
        "#
        .parse()
        .unwrap();
        let metrics = &config.devices["fan"].metrics;
        let periodic = metrics[0].generator.as_ref().unwrap();
        assert_eq!(periodic.mode, GenerationMode::Periodic);
        assert_eq!(periodic.period, 60.0);
        assert_eq!(periodic.noise_sigma, 2.5);
        assert_eq!(periodic.anomaly_multiplier, 1.5);
        let walk = metrics[1].generator.as_ref().unwrap();
        assert_eq!(walk.mode, GenerationMode::RandomWalk);
        assert_eq!(walk.anomaly_type, AnomalyKind::Max);
        assert_eq!(walk.step, 1.0);
        assert!(walk.step_range.is_none());
        assert!(metrics[2].generator.is_none());
    }

    #[test]
    fn initial_device_defaults_to_first_declared() {
        let config: AppConfig = r#"
            [devices.b]
            name = "B"
            [devices.a]
            name = "A"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.initial_device().as_deref(), Some("b"));
    }

    #[test]
    fn rejects_unknown_active_device() {
        let err = r#"
            [engine]
            active_device = "ghost"
            [devices.real]
            name = "Real"
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let err = r#"
            [engine]
            info_log_sample_rate = 1.5
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(format!("{err:#}").contains("info_log_sample_rate"));
    }

    #[test]
    fn loads_first_existing_candidate() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[engine]\nmode = \"backend\"")?;
        file.flush()?;
        let missing = PathBuf::from("definitely/not/here.toml");
        let loaded = AppConfig::load_with_source(&[missing, file.path().to_path_buf()])?;
        assert_eq!(loaded.config.engine.mode, Mode::Backend);
        assert_eq!(loaded.source, file.path());
        Ok(())
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("AI".parse::<Mode>().unwrap(), Mode::Ai);
        assert_eq!("Backend".parse::<Mode>().unwrap(), Mode::Backend);
        assert!("cloud".parse::<Mode>().is_err());
    }
}
