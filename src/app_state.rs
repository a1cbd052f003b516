use chrono::Utc;
use std::sync::Arc;

use crate::artifact_store::{ArtifactStore, FsArtifactStore};
use crate::audit::AuditLog;
use crate::benchmark::BenchmarkSet;
use crate::config::AppConfig;
use crate::control_loop::ControlLoop;
use crate::errors::LoopResult;
use crate::feedback_store::FeedbackStore;
use crate::feedback_store_sled::SledFeedbackStore;
use crate::monitoring::MonitoringEngine;
use crate::orchestrator::RetrainingOrchestrator;
use crate::pipeline::{LinearPipeline, TrainingPipeline};
use crate::prediction::PredictionService;
use crate::registry::ModelRegistry;
use crate::trigger::{RetrainingTrigger, TriggerPolicy};

/// Fully wired runtime shared by the HTTP and CLI surfaces.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn FeedbackStore>,
    pub registry: Arc<ModelRegistry>,
    pub audit: Arc<AuditLog>,
    pub predictions: Arc<PredictionService>,
    pub control: Arc<ControlLoop>,
}

impl AppState {
    /// Open the on-disk stores named in `config` and wire everything.
    pub fn open(config: AppConfig) -> LoopResult<Self> {
        let store: Arc<dyn FeedbackStore> = Arc::new(SledFeedbackStore::open(&config.data_dir)?);
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::open(&config.artifact_dir)?);
        let audit = Arc::new(AuditLog::open(&config.audit_log_path)?);
        Self::from_parts(config, store, artifacts, Arc::new(LinearPipeline::default()), audit)
    }

    /// Wire the runtime from explicit collaborators.
    pub fn from_parts(
        config: AppConfig,
        store: Arc<dyn FeedbackStore>,
        artifacts: Arc<dyn ArtifactStore>,
        pipeline: Arc<dyn TrainingPipeline>,
        audit: Arc<AuditLog>,
    ) -> LoopResult<Self> {
        config.validate()?;
        let control_cfg = config.control.clone();
        let benchmark = Arc::new(BenchmarkSet::from_config(control_cfg.benchmark_path.as_deref())?);

        let registry = Arc::new(
            ModelRegistry::open(artifacts, pipeline.as_ref(), &benchmark)?.with_audit(audit.clone()),
        );

        let monitoring = Arc::new(MonitoringEngine::new(
            store.clone(),
            registry.clone(),
            control_cfg.drift_method.statistic(),
            control_cfg.window_size,
            control_cfg.min_sample_count,
        ));

        let anchor = registry
            .get_active()?
            .metadata
            .activated_at
            .unwrap_or_else(Utc::now);
        let last_fire = last_trigger_fire(&audit);
        let trigger = Arc::new(
            RetrainingTrigger::new(TriggerPolicy::from(&control_cfg), anchor).with_last_fire(last_fire),
        );

        let orchestrator = Arc::new(RetrainingOrchestrator::new(
            store.clone(),
            monitoring.clone(),
            trigger.clone(),
            registry.clone(),
            pipeline,
            benchmark,
            control_cfg.clone(),
            audit.clone(),
        ));

        let control = Arc::new(ControlLoop::new(
            monitoring,
            trigger,
            orchestrator,
            registry.clone(),
            control_cfg.monitoring_interval(),
            std::time::Duration::from_secs(control_cfg.max_backoff_secs),
        ));

        let predictions = Arc::new(PredictionService::new(
            registry.clone(),
            store.clone(),
            &config.prediction,
        ));

        Ok(Self {
            config,
            store,
            registry,
            audit,
            predictions,
            control,
        })
    }
}

/// Most recent trigger fire recorded in the audit trail.
fn last_trigger_fire(audit: &AuditLog) -> Option<chrono::DateTime<Utc>> {
    match audit.events() {
        Ok(events) => events
            .iter()
            .rev()
            .find(|e| e.actor == "trigger" && e.action == "fired")
            .map(|e| e.timestamp),
        Err(e) => {
            tracing::warn!("could not read audit log for last trigger fire: {e}");
            None
        }
    }
}
