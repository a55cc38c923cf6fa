//! ---
//! devsim_section: "01-core-functionality"
//! devsim_subsection: "binary"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Binary entrypoint for the devsim daemon."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use devsim_common::config::{AppConfig, Mode};
use devsim_common::logging::init_tracing;
use devsim_engine::{
    DeviceRegistry, EngineEvent, SimulatedBackend, SimulatedInference, SimulationEngine,
};
use devsim_metrics::{new_registry, spawn_http_server, DaemonMetrics, EngineMetrics};
use devsim_sim::Severity;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["configs/devsim.toml", "configs/example.toml"];

#[derive(Debug, Parser)]
#[command(author, version, about = "Fleet telemetry simulator daemon", long_about = None)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, help = "Override the telemetry mode")]
    mode: Option<CliMode>,

    #[arg(long, global = true, value_name = "ID", help = "Override the active device")]
    device: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Ai,
    Local,
    Backend,
}

impl From<CliMode> for Mode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Ai => Mode::Ai,
            CliMode::Local => Mode::Local,
            CliMode::Backend => Mode::Backend,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the engine until interrupted")]
    Run,
    #[command(about = "Print a deterministic local-physics run as JSON lines")]
    Simulate {
        #[arg(long, default_value_t = 10, help = "Number of ticks to run")]
        ticks: u32,
        #[arg(long, default_value_t = 42, help = "Random seed used when the config sets none")]
        seed: u64,
        #[arg(long, default_value_t = 0, help = "Epoch milliseconds of the first tick")]
        start_ms: i64,
    },
    #[command(about = "List the configured device fleet")]
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.extend(DEFAULT_CONFIG_CANDIDATES.iter().map(PathBuf::from));

    let load_started = Instant::now();
    let explicit = cli.config.is_some() || std::env::var_os(AppConfig::ENV_CONFIG_PATH).is_some();
    let (mut config, config_source) = match AppConfig::load_with_source(&candidates) {
        Ok(loaded) => (loaded.config, Some(loaded.source)),
        Err(err) if !explicit => {
            eprintln!("{err:#}; using built-in defaults");
            (AppConfig::default(), None)
        }
        Err(err) => return Err(err),
    };
    let load_duration = load_started.elapsed();

    if let Some(mode) = cli.mode {
        config.engine.mode = mode.into();
    }
    if let Some(device) = &cli.device {
        config.engine.active_device = Some(device.clone());
    }
    config.validate().context("invalid configuration after overrides")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("devsimd", &config.logging)?;
            info!(
                source = %config_source.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "defaults".into()),
                devices = config.devices.len(),
                "configuration loaded"
            );
            run_daemon(config, load_duration).await
        }
        Commands::Simulate {
            ticks,
            seed,
            start_ms,
        } => simulate(config, ticks, seed, start_ms),
        Commands::Devices => list_devices(&config),
    }
}

async fn run_daemon(config: AppConfig, config_load: Duration) -> Result<()> {
    let metrics_registry = new_registry();
    DaemonMetrics::new(&metrics_registry)?.record_boot(config_load, config.devices.len());
    let engine_metrics = EngineMetrics::new(metrics_registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        Some(spawn_http_server(metrics_registry, config.metrics.listen).await?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let seed = config.engine.random_seed;
    let registry = DeviceRegistry::from_config(&config);
    let backend = Arc::new(SimulatedBackend::new(
        registry.clone(),
        &config.backend,
        seed.map(|s| s.wrapping_add(1)),
    ));
    let inference = Arc::new(SimulatedInference::new(
        &config.inference,
        config.engine.tick_interval,
        seed.map(|s| s.wrapping_add(2)),
    ));

    let engine = SimulationEngine::builder(registry)
        .config(config.engine.clone())
        .backend(backend)
        .inference(inference)
        .metrics(engine_metrics)
        .build();

    let events = tokio::spawn(report_events(engine.clone()));
    let scheduler = engine.start();

    info!(mode = %engine.mode(), device = engine.active_device().as_deref().unwrap_or("-"), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    scheduler.stop().await;
    events.abort();
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

/// Mirror the visible log stream and selection changes into tracing.
async fn report_events(engine: SimulationEngine) {
    let mut events = engine.subscribe();
    loop {
        match events.recv().await {
            Ok(EngineEvent::Log(entry)) => match entry.severity {
                Severity::Critical => {
                    error!(device = %entry.device_id, timestamp = entry.timestamp, "{}", entry.message)
                }
                Severity::Warning => {
                    warn!(device = %entry.device_id, timestamp = entry.timestamp, "{}", entry.message)
                }
                Severity::Info => {
                    info!(device = %entry.device_id, timestamp = entry.timestamp, "{}", entry.message)
                }
            },
            Ok(EngineEvent::DeviceSelected { device_id }) => {
                info!(device = device_id.as_deref().unwrap_or("-"), "active device changed")
            }
            Ok(EngineEvent::ModeChanged { mode }) => info!(mode = %mode, "mode changed"),
            Ok(EngineEvent::Sample { .. }) | Ok(EngineEvent::SourceFailed { .. }) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "event reporter lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn simulate(mut config: AppConfig, ticks: u32, seed: u64, start_ms: i64) -> Result<()> {
    config.engine.mode = Mode::Local;
    if config.engine.random_seed.is_none() {
        config.engine.random_seed = Some(seed);
    }
    let registry = DeviceRegistry::from_config(&config);
    let device = config
        .initial_device()
        .ok_or_else(|| anyhow!("no devices configured; add a [devices.<id>] section"))?;
    if !registry.contains(&device) {
        return Err(anyhow!("device '{}' is not configured", device));
    }

    let engine = SimulationEngine::builder(registry)
        .config(config.engine.clone())
        .build();
    engine.select_device(device);

    let spacing = config.engine.tick_interval.as_millis() as i64;
    for k in 0..i64::from(ticks) {
        engine.tick_at(start_ms + k * spacing);
        if let Some(step) = engine.history().last() {
            println!("{}", serde_json::to_string(step)?);
        }
    }
    Ok(())
}

fn list_devices(config: &AppConfig) -> Result<()> {
    let registry = DeviceRegistry::from_config(config);
    if registry.is_empty() {
        println!("no devices configured");
        return Ok(());
    }
    let active = config.initial_device();
    for device in registry.devices() {
        let marker = if active.as_deref() == Some(device.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<16} {:<8} {:<24} metrics={}",
            marker,
            device.id,
            device.status.as_str(),
            if device.current_scenario.is_empty() {
                "-"
            } else {
                device.current_scenario.as_str()
            },
            device.metrics.len()
        );
    }
    Ok(())
}
