//! ---
//! devsim_section: "04-orchestration"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Simulation engine dispatching ticks to telemetry sources."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use devsim_common::time::epoch_millis_now;
use devsim_common::{EngineConfig, Mode};
use devsim_metrics::EngineMetrics;
use devsim_sim::{
    source_from_seed, Device, MetricMap, PhysicsModel, RandomSource, SimulationBatch,
    SimulationStep,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::controller::{ModeController, RosterChange};
use crate::history::{AppendOutcome, HistoryStore};
use crate::log_filter::{LogEntry, LogFilter};
use crate::prefetch::{FetchTicket, PrefetchBuffer};
use crate::registry::DeviceRegistry;
use crate::scheduler::{self, SchedulerHandle};
use crate::source::{BackendClient, BatchInference, SourceError, SourceKind, TickPlan};

const EVENT_CAPACITY: usize = 256;
const ALL_MODES: [&str; 3] = ["ai", "local", "backend"];

/// Notifications published to subscribers as the engine runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Sample {
        device_id: String,
        source: SourceKind,
        step: SimulationStep,
    },
    Log(LogEntry),
    DeviceSelected {
        device_id: Option<String>,
    },
    ModeChanged {
        mode: Mode,
    },
    SourceFailed {
        source: SourceKind,
        error: String,
    },
}

/// What a single tick did. Out-of-band work started by the tick can be awaited
/// with [`TickOutcome::settle`].
#[derive(Debug)]
pub struct TickOutcome {
    pub plan: TickPlan,
    pub source: Option<SourceKind>,
    pub append: Option<AppendOutcome>,
    prefetch: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
}

impl TickOutcome {
    fn new(plan: TickPlan) -> Self {
        Self {
            plan,
            source: None,
            append: None,
            prefetch: None,
            poll: None,
        }
    }

    /// Whether this tick started a batch inference request.
    pub fn prefetch_started(&self) -> bool {
        self.prefetch.is_some()
    }

    pub fn poll_started(&self) -> bool {
        self.poll.is_some()
    }

    /// Wait for any request started by this tick to be applied or discarded.
    pub async fn settle(self) {
        for handle in self.prefetch.into_iter().chain(self.poll) {
            if let Err(err) = handle.await {
                warn!(error = %err, "telemetry request task did not complete");
            }
        }
    }
}

#[derive(Debug)]
struct EngineState {
    controller: ModeController,
    history: HistoryStore,
    logs: LogFilter,
    prefetch: PrefetchBuffer,
    physics: PhysicsModel,
    /// Bumped on every device switch and on scheduler stop. Responses tagged
    /// with an older session are discarded.
    session: u64,
    /// Scenario seen on the previous tick of the active device.
    scenario: Option<String>,
}

impl EngineState {
    /// Called after the controller has moved to the new device. The incoming
    /// device restarts from its metric minimums since its history is gone.
    fn reset_for_device_switch(&mut self) {
        self.history.reset();
        self.logs.reset();
        self.prefetch.invalidate();
        if let Some(device_id) = self.controller.active_device() {
            self.physics.reset(device_id);
        }
        self.session += 1;
        self.scenario = None;
    }
}

struct Shared {
    config: EngineConfig,
    registry: DeviceRegistry,
    state: Mutex<EngineState>,
    backend: Option<Arc<dyn BackendClient>>,
    inference: Option<Arc<dyn BatchInference>>,
    metrics: Option<EngineMetrics>,
    events: broadcast::Sender<EngineEvent>,
}

pub struct EngineBuilder {
    registry: DeviceRegistry,
    config: EngineConfig,
    backend: Option<Arc<dyn BackendClient>>,
    inference: Option<Arc<dyn BatchInference>>,
    metrics: Option<EngineMetrics>,
    physics_random: Option<Box<dyn RandomSource>>,
    log_random: Option<Box<dyn RandomSource>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn BackendClient>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn inference(mut self, inference: Arc<dyn BatchInference>) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the physics noise source. Defaults to one seeded from the config.
    pub fn physics_random(mut self, source: Box<dyn RandomSource>) -> Self {
        self.physics_random = Some(source);
        self
    }

    /// Override the info-log sampling source. Defaults to one seeded from the config.
    pub fn log_random(mut self, source: Box<dyn RandomSource>) -> Self {
        self.log_random = Some(source);
        self
    }

    pub fn build(self) -> SimulationEngine {
        let config = self.config;
        let active = config
            .active_device
            .clone()
            .or_else(|| self.registry.first_id());
        let physics_random = self
            .physics_random
            .unwrap_or_else(|| source_from_seed(config.physics_seed()));
        let log_random = self
            .log_random
            .unwrap_or_else(|| source_from_seed(config.log_seed()));

        let state = EngineState {
            controller: ModeController::new(config.mode, active.clone()),
            history: HistoryStore::new(config.history_capacity),
            logs: LogFilter::new(log_random, config.info_log_sample_rate, config.log_capacity),
            prefetch: PrefetchBuffer::new(config.prefetch_low_water),
            physics: PhysicsModel::new(physics_random),
            session: 0,
            scenario: None,
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_mode(config.mode.as_str(), &ALL_MODES);
        }
        info!(
            mode = %config.mode,
            device = active.as_deref().unwrap_or("-"),
            devices = self.registry.len(),
            backend = self.backend.is_some(),
            inference = self.inference.is_some(),
            "simulation engine ready"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        SimulationEngine {
            shared: Arc::new(Shared {
                config,
                registry: self.registry,
                state: Mutex::new(state),
                backend: self.backend,
                inference: self.inference,
                metrics: self.metrics,
                events,
            }),
        }
    }
}

/// Handle to the engine. Clones share the same state.
#[derive(Clone)]
pub struct SimulationEngine {
    shared: Arc<Shared>,
}

impl SimulationEngine {
    pub fn builder(registry: DeviceRegistry) -> EngineBuilder {
        EngineBuilder {
            registry,
            config: EngineConfig::default(),
            backend: None,
            inference: None,
            metrics: None,
            physics_random: None,
            log_random: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.shared.registry
    }

    pub fn mode(&self) -> Mode {
        self.shared.state.lock().controller.mode()
    }

    pub fn active_device(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .controller
            .active_device()
            .map(str::to_owned)
    }

    pub fn history(&self) -> Vec<SimulationStep> {
        self.shared.state.lock().history.snapshot()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.shared.state.lock().logs.snapshot()
    }

    pub fn prefetch_len(&self) -> usize {
        self.shared.state.lock().prefetch.len()
    }

    pub fn fetch_in_flight(&self) -> bool {
        self.shared.state.lock().prefetch.is_in_flight()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Spawn the tick and roster loops.
    pub fn start(&self) -> SchedulerHandle {
        scheduler::spawn(self.clone())
    }

    /// Make `device_id` active. Resets history, visible logs, and lookahead when it changes.
    pub fn select_device(&self, device_id: impl Into<String>) -> bool {
        self.switch_device(Some(device_id.into()))
    }

    pub fn clear_device(&self) -> bool {
        self.switch_device(None)
    }

    fn switch_device(&self, device_id: Option<String>) -> bool {
        {
            let mut state = self.shared.state.lock();
            if !state.controller.select_device(device_id.clone()) {
                return false;
            }
            state.reset_for_device_switch();
            self.publish_gauges(&state);
        }
        info!(device = device_id.as_deref().unwrap_or("-"), "active device switched");
        self.emit(EngineEvent::DeviceSelected { device_id });
        true
    }

    /// Switch the telemetry mode. Buffers are kept. Entering backend mode
    /// refreshes the roster in the background; the returned handle resolves
    /// once that refresh has been applied.
    pub fn set_mode(&self, mode: Mode) -> Option<JoinHandle<()>> {
        let transition = self.shared.state.lock().controller.set_mode(mode);
        if !transition.changed() {
            return None;
        }
        info!(from = %transition.from, to = %transition.to, "telemetry mode switched");
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_mode(mode.as_str(), &ALL_MODES);
        }
        self.emit(EngineEvent::ModeChanged { mode });

        if !transition.refreshes_roster() || self.shared.backend.is_none() {
            return None;
        }
        let engine = self.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = engine.refresh_roster().await {
                debug!(error = %err, "roster refresh on entering backend mode failed");
            }
        }))
    }

    /// Pull the roster from the backend, replace the registry, and re-home the
    /// active device if it is no longer listed.
    pub async fn refresh_roster(&self) -> Result<RosterChange, SourceError> {
        let Some(backend) = self.shared.backend.clone() else {
            return Err(SourceError::Unavailable(
                "no backend client configured".to_owned(),
            ));
        };
        let devices = match self.call_remote(backend.fetch_devices()).await {
            Ok(devices) => devices,
            Err(err) => {
                self.record_failure(SourceKind::Backend, &err);
                return Err(err);
            }
        };
        self.shared.registry.replace_all(devices.iter().cloned());

        let change = {
            let mut state = self.shared.state.lock();
            let change = state.controller.reconcile_roster(&devices);
            if change != RosterChange::Unchanged {
                state.reset_for_device_switch();
                self.publish_gauges(&state);
            }
            change
        };
        match &change {
            RosterChange::Unchanged => debug!(devices = devices.len(), "device roster refreshed"),
            RosterChange::Switched(id) => {
                info!(device = %id, "active device missing from roster, switched to first listed");
                self.emit(EngineEvent::DeviceSelected {
                    device_id: Some(id.clone()),
                });
            }
            RosterChange::Cleared => {
                warn!("backend roster is empty, no active device");
                self.emit(EngineEvent::DeviceSelected { device_id: None });
            }
        }
        Ok(change)
    }

    pub(crate) fn observe_tick_lateness(&self, lateness: Duration) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.observe_tick_lateness(lateness);
        }
    }

    pub fn tick(&self) -> TickOutcome {
        self.tick_at(epoch_millis_now())
    }

    /// Run one tick with `now` as the current epoch-millisecond time.
    pub fn tick_at(&self, now: i64) -> TickOutcome {
        let mut state = self.shared.state.lock();
        let mode = state.controller.mode();
        let device = state
            .controller
            .active_device()
            .and_then(|id| self.shared.registry.device(id));
        let plan = TickPlan::resolve(mode, device.as_ref());
        let mut outcome = TickOutcome::new(plan);
        let Some(device) = device else {
            trace!(mode = %mode, "tick without an active device");
            return outcome;
        };

        if state.scenario.as_deref() != Some(device.current_scenario.as_str()) {
            if state.scenario.is_some() {
                debug!(device = %device.id, scenario = %device.current_scenario, "scenario changed, discarding lookahead");
                state.prefetch.invalidate();
            }
            state.scenario = Some(device.current_scenario.clone());
        }

        match plan {
            TickPlan::Idle | TickPlan::Skip => {}
            TickPlan::Local => {
                let step = state.physics.generate(&device, now);
                outcome.source = Some(SourceKind::Local);
                outcome.append = Some(self.commit(&mut state, &device.id, SourceKind::Local, step));
            }
            TickPlan::Buffered => {
                let (source, step) = match state.prefetch.pop() {
                    Some(step) => (SourceKind::Inference, step.restamped(now)),
                    None => {
                        debug!(device = %device.id, "lookahead empty, using local physics");
                        (SourceKind::Local, state.physics.generate(&device, now))
                    }
                };
                outcome.source = Some(source);
                outcome.append = Some(self.commit(&mut state, &device.id, source, step));
                outcome.prefetch = self.maybe_prefetch(&mut state, &device);
            }
            TickPlan::Poll => {
                let session = state.session;
                drop(state);
                match self.shared.backend.clone() {
                    Some(backend) => {
                        outcome.source = Some(SourceKind::Backend);
                        outcome.poll = Some(self.spawn_poll(backend, device.id, session));
                    }
                    None => self.record_failure(
                        SourceKind::Backend,
                        &SourceError::Unavailable("no backend client configured".to_owned()),
                    ),
                }
                self.count_tick(mode, outcome.source);
                return outcome;
            }
        }
        drop(state);
        self.count_tick(mode, outcome.source);
        outcome
    }

    /// Discard every response still in flight. Called when the scheduler stops.
    pub(crate) fn end_session(&self) {
        let mut state = self.shared.state.lock();
        state.session += 1;
        debug!(session = state.session, "engine session closed");
    }

    fn maybe_prefetch(&self, state: &mut EngineState, device: &Device) -> Option<JoinHandle<()>> {
        let inference = self.shared.inference.clone()?;
        if !state.prefetch.needs_refill() {
            return None;
        }
        let ticket = state.prefetch.try_begin(&device.id)?;
        let hint = state.history.last_metrics().cloned();
        debug!(
            device = %device.id,
            queued = state.prefetch.len(),
            ticket = ticket.id,
            "requesting inference batch"
        );
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_in_flight(true);
        }
        Some(self.spawn_prefetch(inference, ticket, state.session, device.clone(), hint))
    }

    fn spawn_prefetch(
        &self,
        inference: Arc<dyn BatchInference>,
        ticket: FetchTicket,
        session: u64,
        device: Device,
        hint: Option<MetricMap>,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let _release = InFlightRelease {
                engine: engine.clone(),
                ticket_id: ticket.id,
            };
            let result = engine
                .call_remote(inference.fetch_simulation_batch(&device, hint.as_ref()))
                .await;
            match result {
                Ok(Some(batch)) => engine.accept_batch(&ticket, session, batch),
                Ok(None) => debug!(device = %ticket.device_id, "inference returned no batch"),
                Err(err) => engine.record_failure(SourceKind::Inference, &err),
            }
        })
    }

    fn accept_batch(&self, ticket: &FetchTicket, session: u64, batch: SimulationBatch) {
        let spacing = self.shared.config.tick_interval.as_millis() as i64;
        let steps = batch.into_steps(epoch_millis_now(), spacing);
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let accepted = if state.session == session {
            state
                .prefetch
                .accept(ticket, state.controller.active_device(), steps)
        } else {
            None
        };
        match accepted {
            Some(count) => {
                debug!(device = %ticket.device_id, count, queued = state.prefetch.len(), "inference batch queued");
                self.publish_gauges(state);
            }
            None => debug!(device = %ticket.device_id, ticket = ticket.id, "discarding inference batch for a stale request"),
        }
    }

    fn spawn_poll(
        &self,
        backend: Arc<dyn BackendClient>,
        device_id: String,
        session: u64,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.call_remote(backend.fetch_device_data(&device_id)).await {
                Ok(Some(step)) => engine.accept_live_sample(&device_id, session, step),
                Ok(None) => trace!(device = %device_id, "backend had no sample"),
                Err(err) => engine.record_failure(SourceKind::Backend, &err),
            }
        })
    }

    fn accept_live_sample(&self, device_id: &str, session: u64, step: SimulationStep) {
        let mut state = self.shared.state.lock();
        if state.session != session || state.controller.active_device() != Some(device_id) {
            debug!(device = device_id, "discarding backend sample for a previous session");
            return;
        }
        self.commit(&mut state, device_id, SourceKind::Backend, step);
    }

    fn commit(
        &self,
        state: &mut EngineState,
        device_id: &str,
        source: SourceKind,
        step: SimulationStep,
    ) -> AppendOutcome {
        let outcome = state.history.append(step.clone());
        if outcome.is_appended() {
            if source != SourceKind::Local {
                state.physics.observe(device_id, &step.metrics);
            }
            let entry = state.logs.maybe_append(device_id, &step);
            self.emit(EngineEvent::Sample {
                device_id: device_id.to_owned(),
                source,
                step,
            });
            if let Some(entry) = entry {
                self.emit(EngineEvent::Log(entry));
            }
        } else {
            debug!(
                device = device_id,
                source = %source,
                timestamp = step.timestamp,
                reason = outcome.as_str(),
                "sample dropped"
            );
            if let Some(metrics) = &self.shared.metrics {
                metrics.record_dropped(outcome.as_str());
            }
        }
        self.publish_gauges(state);
        outcome
    }

    async fn call_remote<T>(
        &self,
        request: impl Future<Output = Result<T, SourceError>>,
    ) -> Result<T, SourceError> {
        let limit = self.shared.config.remote_timeout;
        match timeout(limit, request).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(limit)),
        }
    }

    fn record_failure(&self, source: SourceKind, err: &SourceError) {
        warn!(source = %source, error = %err, "telemetry source failed");
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_source_failure(source.as_str());
        }
        self.emit(EngineEvent::SourceFailed {
            source,
            error: err.to_string(),
        });
    }

    fn count_tick(&self, mode: Mode, source: Option<SourceKind>) {
        if let (Some(metrics), Some(source)) = (&self.shared.metrics, source) {
            metrics.record_tick(mode.as_str(), source.as_str());
        }
    }

    fn publish_gauges(&self, state: &EngineState) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_history_len(state.history.len());
            metrics.set_prefetch_depth(state.prefetch.len());
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is not an error.
        let _ = self.shared.events.send(event);
    }
}

/// Releases the single-flight slot when the request task ends, including on panic.
struct InFlightRelease {
    engine: SimulationEngine,
    ticket_id: u64,
}

impl Drop for InFlightRelease {
    fn drop(&mut self) {
        let released = self
            .engine
            .shared
            .state
            .lock()
            .prefetch
            .finish(self.ticket_id);
        if released {
            if let Some(metrics) = &self.engine.shared.metrics {
                metrics.set_in_flight(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use devsim_metrics::new_registry;
    use devsim_sim::{BatchItem, DeviceStatus, FixedRandom, MetricConfig, Severity};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::registry::DevicePatch;

    fn running(id: &str) -> Device {
        Device::new(id, id)
            .with_status(DeviceStatus::Running)
            .with_metric(MetricConfig::new("temp", 0.0, 100.0))
    }

    fn fleet() -> DeviceRegistry {
        DeviceRegistry::from_devices([running("pump"), running("fan")])
    }

    fn config(mode: Mode) -> EngineConfig {
        EngineConfig {
            mode,
            ..EngineConfig::default()
        }
    }

    fn batch_of(size: usize, value: f64) -> SimulationBatch {
        let mut metrics = MetricMap::new();
        metrics.insert("temp".into(), value);
        SimulationBatch {
            batch: (0..size)
                .map(|_| BatchItem {
                    metrics: metrics.clone(),
                    log_message: Some("predicted".into()),
                    severity: Severity::Info,
                })
                .collect(),
        }
    }

    /// Blocks every request until a permit is released.
    struct GatedInference {
        gate: Semaphore,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl GatedInference {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        async fn wait_for_calls(&self, expected: usize) {
            for _ in 0..200 {
                if self.calls.load(Ordering::SeqCst) >= expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("inference was not called {expected} times");
        }
    }

    #[async_trait]
    impl BatchInference for GatedInference {
        async fn fetch_simulation_batch(
            &self,
            _device: &Device,
            _last_metrics: Option<&MetricMap>,
        ) -> Result<Option<SimulationBatch>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(batch_of(5, 42.0)))
        }
    }

    struct FailingInference;

    #[async_trait]
    impl BatchInference for FailingInference {
        async fn fetch_simulation_batch(
            &self,
            _device: &Device,
            _last_metrics: Option<&MetricMap>,
        ) -> Result<Option<SimulationBatch>, SourceError> {
            Err(SourceError::Unavailable("model offline".into()))
        }
    }

    struct PanickingInference;

    #[async_trait]
    impl BatchInference for PanickingInference {
        async fn fetch_simulation_batch(
            &self,
            _device: &Device,
            _last_metrics: Option<&MetricMap>,
        ) -> Result<Option<SimulationBatch>, SourceError> {
            panic!("inference client bug");
        }
    }

    /// Replays scripted samples and a fixed roster.
    struct ScriptedBackend {
        samples: parking_lot::Mutex<VecDeque<SimulationStep>>,
        roster: Vec<Device>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(samples: Vec<SimulationStep>, roster: Vec<Device>) -> Arc<Self> {
            Arc::new(Self {
                samples: parking_lot::Mutex::new(samples.into()),
                roster,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BackendClient for ScriptedBackend {
        async fn fetch_devices(&self) -> Result<Vec<Device>, SourceError> {
            Ok(self.roster.clone())
        }

        async fn fetch_device_data(
            &self,
            _device_id: &str,
        ) -> Result<Option<SimulationStep>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.samples.lock().pop_front())
        }
    }

    fn sample(timestamp: i64, value: f64) -> SimulationStep {
        let mut metrics = MetricMap::new();
        metrics.insert("temp".into(), value);
        SimulationStep::new(timestamp, metrics)
    }

    #[tokio::test]
    async fn empty_lookahead_falls_back_to_local_and_requests_batch() {
        let inference = GatedInference::new();
        let engine = SimulationEngine::builder(fleet())
            .config(config(Mode::Ai))
            .inference(inference.clone())
            .build();

        let outcome = engine.tick_at(1_000);
        assert_eq!(outcome.plan, TickPlan::Buffered);
        assert_eq!(outcome.source, Some(SourceKind::Local));
        assert_eq!(outcome.append, Some(AppendOutcome::Appended));
        assert!(outcome.prefetch_started());
        assert!(engine.fetch_in_flight());

        inference.gate.add_permits(1);
        outcome.settle().await;
        assert!(!engine.fetch_in_flight());
        assert_eq!(engine.prefetch_len(), 5);

        let next = engine.tick_at(2_000);
        assert_eq!(next.source, Some(SourceKind::Inference));
        let history = engine.history();
        assert_eq!(history.last().unwrap().timestamp, 2_000);
        assert_eq!(history.last().unwrap().metrics["temp"], 42.0);
        // Four steps left is below the low-water mark.
        assert!(next.prefetch_started());
        inference.gate.add_permits(1);
        next.settle().await;
    }

    #[tokio::test]
    async fn at_most_one_batch_request_in_flight() {
        let inference = GatedInference::new();
        let engine = SimulationEngine::builder(fleet())
            .config(config(Mode::Ai))
            .inference(inference.clone())
            .build();

        let outcomes: Vec<TickOutcome> = (1..=20).map(|k| engine.tick_at(k * 100)).collect();
        inference.wait_for_calls(1).await;
        assert_eq!(outcomes.iter().filter(|o| o.prefetch_started()).count(), 1);
        assert!(outcomes
            .iter()
            .all(|o| o.source == Some(SourceKind::Local)));

        inference.gate.add_permits(1);
        futures::future::join_all(outcomes.into_iter().map(TickOutcome::settle)).await;
        assert_eq!(inference.calls.load(Ordering::SeqCst), 1);
        assert_eq!(inference.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(engine.prefetch_len(), 5);
    }

    #[tokio::test]
    async fn device_switch_clears_buffers_and_discards_late_batch() {
        let inference = GatedInference::new();
        let engine = SimulationEngine::builder(fleet())
            .config(config(Mode::Ai))
            .inference(inference.clone())
            .build();

        let outcome = engine.tick_at(1_000);
        assert!(!engine.history().is_empty());
        assert!(engine.select_device("fan"));
        assert!(engine.history().is_empty());
        assert!(engine.logs().is_empty());
        assert_eq!(engine.prefetch_len(), 0);

        // The orphaned request still holds the slot until it resolves.
        assert!(!engine.tick_at(2_000).prefetch_started());
        inference.gate.add_permits(1);
        outcome.settle().await;
        assert_eq!(engine.prefetch_len(), 0);
        assert!(!engine.fetch_in_flight());

        let fresh = engine.tick_at(3_000);
        assert!(fresh.prefetch_started());
        inference.gate.add_permits(1);
        fresh.settle().await;
        assert_eq!(engine.prefetch_len(), 5);
        assert!(!engine.select_device("fan"));
    }

    #[tokio::test]
    async fn scenario_change_invalidates_lookahead() {
        let inference = GatedInference::new();
        let registry = fleet();
        let engine = SimulationEngine::builder(registry.clone())
            .config(config(Mode::Ai))
            .inference(inference.clone())
            .build();

        inference.gate.add_permits(1);
        engine.tick_at(1_000).settle().await;
        assert_eq!(engine.prefetch_len(), 5);

        registry.update_device("pump", DevicePatch::scenario("Coolant leak"));
        let outcome = engine.tick_at(2_000);
        assert_eq!(outcome.source, Some(SourceKind::Local));
        assert_eq!(engine.history().len(), 2);
        inference.gate.add_permits(1);
        outcome.settle().await;
    }

    #[tokio::test]
    async fn failed_batch_is_recorded_and_releases_slot() {
        let registry = new_registry();
        let metrics = EngineMetrics::new(registry.clone()).unwrap();
        let engine = SimulationEngine::builder(fleet())
            .config(config(Mode::Ai))
            .inference(Arc::new(FailingInference))
            .metrics(metrics)
            .build();
        let mut events = engine.subscribe();

        engine.tick_at(1_000).settle().await;
        assert!(!engine.fetch_in_flight());
        assert_eq!(engine.prefetch_len(), 0);

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::SourceFailed { source, error } = event {
                assert_eq!(source, SourceKind::Inference);
                assert!(error.contains("model offline"));
                failed = true;
            }
        }
        assert!(failed);

        let outcome = engine.tick_at(2_000);
        assert_eq!(outcome.source, Some(SourceKind::Local));
        assert!(outcome.prefetch_started());
        outcome.settle().await;

        let failures = registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "devsim_source_failures_total")
            .unwrap();
        assert_eq!(failures.get_metric()[0].get_counter().get_value(), 2.0);
    }

    #[tokio::test]
    async fn panicking_request_still_releases_slot() {
        let engine = SimulationEngine::builder(fleet())
            .config(config(Mode::Ai))
            .inference(Arc::new(PanickingInference))
            .build();
        engine.tick_at(1_000).settle().await;
        assert!(!engine.fetch_in_flight());
        assert!(engine.tick_at(2_000).prefetch_started());
    }

    #[tokio::test]
    async fn backend_duplicate_timestamps_keep_first_sample() {
        let backend = ScriptedBackend::new(vec![sample(1_000, 10.0), sample(1_000, 20.0)], vec![]);
        let engine = SimulationEngine::builder(fleet())
            .config(config(Mode::Backend))
            .backend(backend.clone())
            .build();

        for now in [5_000, 6_000] {
            let outcome = engine.tick_at(now);
            assert!(outcome.poll_started());
            outcome.settle().await;
        }
        let history = engine.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp, 1_000);
        assert_eq!(history[0].metrics["temp"], 10.0);
    }

    #[tokio::test]
    async fn backend_mode_skips_stopped_devices() {
        let backend = ScriptedBackend::new(vec![sample(1_000, 1.0)], vec![]);
        let registry = fleet();
        registry.update_device_status("pump", DeviceStatus::Stopped);
        let engine = SimulationEngine::builder(registry)
            .config(config(Mode::Backend))
            .backend(backend.clone())
            .build();

        let outcome = engine.tick_at(1_000);
        assert_eq!(outcome.plan, TickPlan::Skip);
        assert!(!outcome.poll_started());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(engine.history().is_empty());
    }

    #[tokio::test]
    async fn backend_sample_after_switch_is_discarded() {
        let backend = ScriptedBackend::new(vec![sample(1_000, 1.0)], vec![]);
        let engine = SimulationEngine::builder(fleet())
            .config(config(Mode::Backend))
            .backend(backend)
            .build();
        let outcome = engine.tick_at(1_000);
        engine.select_device("fan");
        outcome.settle().await;
        assert!(engine.history().is_empty());
    }

    #[tokio::test]
    async fn entering_backend_mode_rehomes_active_device() {
        let backend = ScriptedBackend::new(vec![], vec![running("press"), running("mixer")]);
        let registry = fleet();
        let engine = SimulationEngine::builder(registry.clone())
            .backend(backend)
            .build();
        engine.tick_at(1_000);
        assert_eq!(engine.active_device().as_deref(), Some("pump"));

        let refresh = engine.set_mode(Mode::Backend).unwrap();
        refresh.await.unwrap();
        assert_eq!(engine.active_device().as_deref(), Some("press"));
        assert!(engine.history().is_empty());
        assert_eq!(registry.len(), 2);
        assert!(engine.set_mode(Mode::Backend).is_none());
    }

    #[tokio::test]
    async fn empty_roster_clears_active_device() {
        let backend = ScriptedBackend::new(vec![], vec![]);
        let engine = SimulationEngine::builder(fleet())
            .config(config(Mode::Backend))
            .backend(backend)
            .build();
        assert_eq!(engine.refresh_roster().await, Ok(RosterChange::Cleared));
        let outcome = engine.tick_at(1_000);
        assert_eq!(outcome.plan, TickPlan::Idle);
        assert!(outcome.source.is_none());
    }

    #[tokio::test]
    async fn returning_to_a_device_restarts_its_physics_cold() {
        let engine = SimulationEngine::builder(fleet())
            .physics_random(Box::new(FixedRandom(0.5)))
            .build();
        let first = engine.tick_at(1_000);
        assert_eq!(first.source, Some(SourceKind::Local));
        let cold = engine.history()[0].metrics["temp"];
        assert!((cold - 2.5).abs() < 1e-9, "cold start produced {cold}");
        for k in 2..=20 {
            engine.tick_at(k * 1_000);
        }
        assert!(engine.history().last().unwrap().metrics["temp"] > 30.0);

        assert!(engine.select_device("fan"));
        engine.tick_at(21_000);
        assert!(engine.select_device("pump"));
        assert!(engine.history().is_empty());

        engine.tick_at(22_000);
        let history = engine.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].metrics["temp"], cold);
    }

    #[tokio::test]
    async fn roster_switch_restarts_physics_for_the_new_device() {
        let backend = ScriptedBackend::new(vec![], vec![running("fan")]);
        let engine = SimulationEngine::builder(fleet())
            .backend(backend)
            .physics_random(Box::new(FixedRandom(0.5)))
            .build();
        assert!(engine.select_device("fan"));
        for k in 1..=10 {
            engine.tick_at(k * 1_000);
        }
        assert!(engine.select_device("pump"));
        assert_eq!(
            engine.refresh_roster().await,
            Ok(RosterChange::Switched("fan".into()))
        );

        engine.tick_at(11_000);
        let value = engine.history()[0].metrics["temp"];
        assert!((value - 2.5).abs() < 1e-9, "fan resumed at {value}");
    }

    #[tokio::test]
    async fn mode_switch_keeps_history() {
        let engine = SimulationEngine::builder(fleet()).build();
        engine.tick_at(1_000);
        engine.tick_at(2_000);
        assert!(engine.set_mode(Mode::Ai).is_none());
        assert_eq!(engine.mode(), Mode::Ai);
        assert_eq!(engine.history().len(), 2);
    }

    #[tokio::test]
    async fn critical_steps_always_reach_the_log_stream() {
        let registry = DeviceRegistry::from_devices([
            running("pump").with_scenario("Bearing failure")
        ]);
        let engine = SimulationEngine::builder(registry)
            .physics_random(Box::new(FixedRandom(0.5)))
            .log_random(Box::new(FixedRandom(0.99)))
            .build();
        let mut events = engine.subscribe();
        for k in 1..=3 {
            engine.tick_at(k * 1_000);
        }
        let logs = engine.logs();
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|entry| entry.severity == Severity::Critical));
        assert_eq!(logs[0].message, "Operating under Bearing failure");

        let mut samples = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::Sample { .. }) {
                samples += 1;
            }
        }
        assert_eq!(samples, 3);
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let event = EngineEvent::Sample {
            device_id: "pump".into(),
            source: SourceKind::Inference,
            step: sample(1_000, 3.5),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "sample");
        assert_eq!(json["source"], "inference");
        assert_eq!(json["step"]["timestamp"], 1_000);
    }

    #[tokio::test]
    async fn repeated_tick_timestamp_is_dropped() {
        let engine = SimulationEngine::builder(fleet()).build();
        assert_eq!(engine.tick_at(1_000).append, Some(AppendOutcome::Appended));
        assert_eq!(engine.tick_at(1_000).append, Some(AppendOutcome::Duplicate));
        assert_eq!(engine.tick_at(500).append, Some(AppendOutcome::Stale));
        assert_eq!(engine.history().len(), 1);
    }
}
