//! ---
//! devsim_section: "04-orchestration"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Periodic tick and roster drivers for the simulation engine."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use devsim_common::{LatenessSummary, Mode, TickLateness};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::SimulationEngine;

/// Fixed-period interval that delays rather than bursts after a stall.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        Self::starting_at(Instant::now(), period)
    }

    /// First tick fires at `start` instead of immediately.
    pub fn starting_at(start: Instant, period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

/// Running tick and roster loops. Dropping the handle without calling
/// [`SchedulerHandle::stop`] leaves both loops running.
pub struct SchedulerHandle {
    engine: SimulationEngine,
    shutdown: watch::Sender<bool>,
    ticks: JoinHandle<()>,
    roster: JoinHandle<()>,
    lateness: Arc<TickLateness>,
}

impl SchedulerHandle {
    pub fn lateness(&self) -> Option<LatenessSummary> {
        self.lateness.summary()
    }

    /// Stop both loops. No tick fires once this returns, and responses to
    /// requests still in flight are discarded.
    pub async fn stop(self) -> Option<LatenessSummary> {
        let _ = self.shutdown.send(true);
        for (name, task) in [("tick", self.ticks), ("roster", self.roster)] {
            if let Err(err) = task.await {
                warn!(task = name, error = %err, "scheduler task ended abnormally");
            }
        }
        self.engine.end_session();
        let summary = self.lateness.summary();
        match &summary {
            Some(late) => info!(
                ticks = late.ticks,
                mean_late_us = late.mean_us,
                max_late_us = late.max_us,
                "scheduler stopped"
            ),
            None => info!("scheduler stopped before the first tick"),
        }
        summary
    }
}

pub(crate) fn spawn(engine: SimulationEngine) -> SchedulerHandle {
    let (shutdown, rx) = watch::channel(false);
    let tick_interval = engine.config().tick_interval;
    let lateness = Arc::new(TickLateness::new());
    info!(
        tick_ms = tick_interval.as_millis() as u64,
        roster_ms = engine.config().roster_interval.as_millis() as u64,
        "scheduler starting"
    );

    let ticks = tokio::spawn(run_ticks(engine.clone(), lateness.clone(), rx.clone()));
    let roster = tokio::spawn(run_roster(engine.clone(), rx));
    SchedulerHandle {
        engine,
        shutdown,
        ticks,
        roster,
        lateness,
    }
}

async fn run_ticks(
    engine: SimulationEngine,
    lateness: Arc<TickLateness>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut limiter = RateLimiter::new(engine.config().tick_interval);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            deadline = limiter.tick() => {
                let late = lateness.observe(deadline.into_std(), std::time::Instant::now());
                engine.observe_tick_lateness(late);
                let outcome = engine.tick();
                debug!(plan = outcome.plan.as_str(), source = ?outcome.source, "tick dispatched");
            }
        }
    }
}

async fn run_roster(engine: SimulationEngine, mut shutdown: watch::Receiver<bool>) {
    let period = engine.config().roster_interval;
    let mut limiter = RateLimiter::starting_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = limiter.tick() => {
                if engine.mode() != Mode::Backend {
                    continue;
                }
                if let Err(err) = engine.refresh_roster().await {
                    debug!(error = %err, "periodic roster refresh failed");
                }
            }
        }
    }
}
