//! control_loop.rs
//! Operator-facing surface of the monitoring/retraining loop and its periodic driver.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::drift_snapshot::DriftSnapshot;
use crate::errors::LoopResult;
use crate::monitoring::MonitoringEngine;
use crate::orchestrator::{RetrainingOrchestrator, RetrainingRun};
use crate::registry::{ActiveModel, ModelRegistry};
use crate::retraining_job::RetrainingJob;
use crate::trigger::{RetrainingTrigger, TriggerDecision};

pub struct ControlLoop {
    pub monitoring: Arc<MonitoringEngine>,
    pub trigger: Arc<RetrainingTrigger>,
    pub orchestrator: Arc<RetrainingOrchestrator>,
    pub registry: Arc<ModelRegistry>,
    interval: Duration,
    max_backoff: Duration,
}

impl ControlLoop {
    pub fn new(
        monitoring: Arc<MonitoringEngine>,
        trigger: Arc<RetrainingTrigger>,
        orchestrator: Arc<RetrainingOrchestrator>,
        registry: Arc<ModelRegistry>,
        interval: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            monitoring,
            trigger,
            orchestrator,
            registry,
            interval,
            max_backoff: max_backoff.max(interval),
        }
    }

    pub fn run_monitoring_cycle(&self) -> DriftSnapshot {
        self.monitoring.run_cycle(Utc::now())
    }

    /// Evaluate and record a fire; a fire here starts the cooldown and is audited.
    pub fn evaluate_trigger(&self, snapshot: &DriftSnapshot) -> LoopResult<TriggerDecision> {
        self.orchestrator.evaluate_trigger(snapshot, Utc::now())
    }

    pub async fn run_retraining_if_triggered(&self) -> RetrainingRun {
        self.orchestrator.run_retraining_if_triggered().await
    }

    /// Current servable model; one pointer clone, never blocked by retraining.
    pub fn get_active_model(&self) -> LoopResult<Arc<ActiveModel>> {
        self.registry.get_active()
    }

    pub fn latest_snapshot(&self) -> LoopResult<Option<DriftSnapshot>> {
        self.monitoring.latest()
    }

    /// Recent retraining jobs, newest first.
    pub fn jobs(&self) -> LoopResult<Vec<RetrainingJob>> {
        self.orchestrator.jobs()
    }

    /// Operator recovery: re-activate an archived version, no job is created.
    pub fn rollback(&self, version: &str) -> LoopResult<Arc<ActiveModel>> {
        self.registry.rollback(version)
    }

    /// Poll until `shutdown` flips to true. Skipped cycles back off exponentially.
    ///
    /// A shutdown signalled while a job runs cancels that job and waits for it
    /// to reach its terminal state.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            max_backoff_secs = self.max_backoff.as_secs(),
            "control loop started"
        );
        let mut delay = self.interval;
        let mut stopping = false;

        while !stopping {
            let cycle = self.run_retraining_if_triggered();
            tokio::pin!(cycle);
            let run = tokio::select! {
                run = &mut cycle => run,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        stopping = true;
                        if let Ok(true) = self.orchestrator.shutdown() {
                            tracing::warn!("cancelling in-flight retraining job on shutdown");
                        }
                    }
                    cycle.await
                }
            };
            log_run(&run);
            if stopping {
                break;
            }

            let skipped = matches!(run, RetrainingRun::CycleSkipped(_));
            delay = next_delay(delay, skipped, self.interval, self.max_backoff);
            if skipped {
                tracing::warn!(retry_in_secs = delay.as_secs(), "monitoring cycle skipped, backing off");
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        stopping = true;
                    }
                }
            }
        }

        tracing::info!("control loop stopped");
    }
}

fn log_run(run: &RetrainingRun) {
    match run {
        RetrainingRun::Finished(job) => tracing::info!(
            job_id = %job.id,
            outcome = %job.outcome,
            version = ?job.model_version,
            duration_ms = job.duration_ms(),
            "retraining job finished"
        ),
        RetrainingRun::Aborted { error } => tracing::error!(%error, "retraining task aborted"),
        _ => {}
    }
}

/// Double after a skipped cycle (capped at `max`), reset to `base` otherwise.
pub fn next_delay(current: Duration, skipped: bool, base: Duration, max: Duration) -> Duration {
    if skipped {
        (current * 2).min(max)
    } else {
        base
    }
}
