//! ---
//! devsim_section: "03-observability"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Metrics collection and export utilities."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Bind `addr` and serve the registry at `/metrics` in the background.
/// Port `0` picks an ephemeral port, see [`MetricsServer::addr`].
pub async fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics exporter on {addr}"))?;
    let addr = listener
        .local_addr()
        .context("metrics exporter has no local address")?;
    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(registry);

    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = stopped.wait_for(|stop| *stop).await;
            })
            .await
            .context("metrics exporter stopped with an error")
    });
    info!(address = %addr, "metrics exporter listening");

    Ok(MetricsServer { addr, stop, task })
}

fn encode_text(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("failed to encode metric families")?;
    String::from_utf8(buffer).context("metric text is not valid utf-8")
}

async fn render(State(registry): State<SharedRegistry>) -> Response {
    match encode_text(&registry) {
        Ok(body) => ([(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT))], body)
            .into_response(),
        Err(err) => {
            error!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Handle to the background exporter task.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for in-flight ones to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.stop.send_replace(true);
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Fleet and startup figures for `devsimd`, set once at boot.
#[derive(Clone, Debug)]
pub struct DaemonMetrics {
    start_time: Gauge,
    config_load_seconds: Histogram,
    devices_configured: IntGauge,
}

impl DaemonMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let start_time = Gauge::with_opts(Opts::new(
            "devsimd_start_time_seconds",
            "Unix time at which the daemon finished booting",
        ))?;
        registry.register(Box::new(start_time.clone()))?;

        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "devsimd_config_load_seconds",
                "Time spent reading and validating the fleet configuration",
            )
            .buckets(prometheus::exponential_buckets(0.0005, 4.0, 7)?),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let devices_configured = IntGauge::with_opts(Opts::new(
            "devsimd_devices_configured",
            "Devices in the seed fleet",
        ))?;
        registry.register(Box::new(devices_configured.clone()))?;

        Ok(Self {
            start_time,
            config_load_seconds,
            devices_configured,
        })
    }

    /// Record a completed boot: when it happened, how long the configuration
    /// took to load and how many devices it declared.
    pub fn record_boot(&self, config_load: Duration, devices: usize) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.start_time.set(now.as_secs_f64());
        self.config_load_seconds.observe(config_load.as_secs_f64());
        self.devices_configured.set(devices as i64);
    }
}

/// Counters and gauges updated by the simulation engine on every tick.
#[derive(Clone, Debug)]
pub struct EngineMetrics {
    registry: SharedRegistry,
    ticks: IntCounterVec,
    dropped_samples: IntCounterVec,
    source_failures: IntCounterVec,
    prefetch_depth: IntGauge,
    history_len: IntGauge,
    fetch_in_flight: IntGauge,
    active_mode: IntGaugeVec,
    tick_lateness: Histogram,
}

impl EngineMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let ticks = IntCounterVec::new(
            Opts::new(
                "devsim_ticks_total",
                "Ticks dispatched, by mode and the source that produced the sample",
            ),
            &["mode", "source"],
        )?;
        registry.register(Box::new(ticks.clone()))?;

        let dropped_samples = IntCounterVec::new(
            Opts::new(
                "devsim_dropped_samples_total",
                "Samples rejected by the history store, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(dropped_samples.clone()))?;

        let source_failures = IntCounterVec::new(
            Opts::new(
                "devsim_source_failures_total",
                "Failed collaborator calls, by source",
            ),
            &["source"],
        )?;
        registry.register(Box::new(source_failures.clone()))?;

        let prefetch_depth = IntGauge::with_opts(Opts::new(
            "devsim_prefetch_queue_depth",
            "Steps waiting in the inference lookahead buffer",
        ))?;
        registry.register(Box::new(prefetch_depth.clone()))?;

        let history_len = IntGauge::with_opts(Opts::new(
            "devsim_history_len",
            "Samples retained for the active device",
        ))?;
        registry.register(Box::new(history_len.clone()))?;

        let fetch_in_flight = IntGauge::with_opts(Opts::new(
            "devsim_prefetch_in_flight",
            "Indicator (0/1) whether a batch inference request is outstanding",
        ))?;
        registry.register(Box::new(fetch_in_flight.clone()))?;

        let active_mode = IntGaugeVec::new(
            Opts::new(
                "devsim_active_mode",
                "Indicator (0/1) of the currently selected telemetry mode",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(active_mode.clone()))?;

        let lateness_buckets = prometheus::exponential_buckets(0.0001, 4.0, 8)
            .context("failed to construct tick lateness buckets")?;
        let tick_lateness = Histogram::with_opts(
            HistogramOpts::new(
                "devsim_tick_lateness_seconds",
                "Delay between a tick's scheduled deadline and its dispatch",
            )
            .buckets(lateness_buckets),
        )?;
        registry.register(Box::new(tick_lateness.clone()))?;

        Ok(Self {
            registry,
            ticks,
            dropped_samples,
            source_failures,
            prefetch_depth,
            history_len,
            fetch_in_flight,
            active_mode,
            tick_lateness,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_tick(&self, mode: &str, source: &str) {
        self.ticks.with_label_values(&[mode, source]).inc();
    }

    pub fn record_dropped(&self, reason: &str) {
        self.dropped_samples.with_label_values(&[reason]).inc();
    }

    pub fn record_source_failure(&self, source: &str) {
        self.source_failures.with_label_values(&[source]).inc();
    }

    pub fn set_prefetch_depth(&self, depth: usize) {
        self.prefetch_depth.set(depth as i64);
    }

    pub fn set_history_len(&self, len: usize) {
        self.history_len.set(len as i64);
    }

    pub fn set_in_flight(&self, in_flight: bool) {
        self.fetch_in_flight.set(i64::from(in_flight));
    }

    pub fn observe_tick_lateness(&self, lateness: Duration) {
        self.tick_lateness.observe(lateness.as_secs_f64());
    }

    /// Mark `mode` active and every other known mode inactive.
    pub fn set_mode(&self, mode: &str, all_modes: &[&str]) {
        for candidate in all_modes {
            self.active_mode
                .with_label_values(&[*candidate])
                .set(i64::from(*candidate == mode));
        }
    }
}

pub use prometheus;
