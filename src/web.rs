use crate::app_state::AppState;
use crate::drift_snapshot::DriftSnapshot;
use crate::errors::LoopResult;
use crate::model_version::ModelVersion;
use crate::monitoring::RecentActivity;
use crate::orchestrator::RetrainingRun;
use crate::prediction::PredictionOutcome;
use crate::records::{FeedbackStats, VersionMetrics, WindowRecord};
use crate::retraining_job::RetrainingJob;
use crate::trigger::TriggerDecision;
use axum::{
    extract::{Extension, Path, Query},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    text: String,
    #[serde(default)]
    consent: bool,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    prediction_id: u64,
    correct: bool,
}

const MAX_RECENT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_recent")]
    limit: usize,
}

fn default_recent() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    #[serde(default = "default_hours")]
    hours: u32,
}

fn default_hours() -> u32 {
    24
}

#[derive(Debug, Serialize)]
pub struct CycleResponse {
    snapshot: DriftSnapshot,
    /// What the trigger would decide now; does not start a cooldown
    preview: TriggerDecision,
}

/// Build the router exposing prediction, monitoring, retraining and registry endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/predict", post(predict))
        .route("/api/feedback", post(feedback))
        .route("/api/monitoring/snapshot", get(latest_snapshot))
        .route("/api/monitoring/cycle", post(run_cycle))
        .route("/api/monitoring/versions", get(version_metrics))
        .route("/api/monitoring/stats", get(feedback_stats))
        .route("/api/monitoring/recent", get(recent_predictions))
        .route("/api/monitoring/activity", get(recent_activity))
        .route("/api/retrain", post(retrain))
        .route("/api/jobs", get(jobs))
        .route("/api/models", get(models))
        .route("/api/models/active", get(active_model))
        .route("/api/models/{version}/rollback", post(rollback))
        // health endpoints
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

async fn predict(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<PredictRequest>,
) -> LoopResult<Json<PredictionOutcome>> {
    Ok(Json(state.predictions.predict(&req.text, req.consent)?))
}

async fn feedback(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<FeedbackRequest>,
) -> LoopResult<Json<serde_json::Value>> {
    state
        .predictions
        .record_feedback(req.prediction_id, req.correct)?;
    Ok(Json(serde_json::json!({
        "prediction_id": req.prediction_id,
        "recorded": true,
    })))
}

async fn latest_snapshot(
    Extension(state): Extension<Arc<AppState>>,
) -> LoopResult<Json<Option<DriftSnapshot>>> {
    Ok(Json(state.control.latest_snapshot()?))
}

async fn run_cycle(Extension(state): Extension<Arc<AppState>>) -> LoopResult<Json<CycleResponse>> {
    let snapshot = state.control.run_monitoring_cycle();
    let preview = state.control.trigger.peek(&snapshot, Utc::now())?;
    Ok(Json(CycleResponse { snapshot, preview }))
}

async fn version_metrics(
    Extension(state): Extension<Arc<AppState>>,
) -> LoopResult<Json<Vec<VersionMetrics>>> {
    Ok(Json(state.control.monitoring.metrics_by_version()?))
}

async fn feedback_stats(
    Extension(state): Extension<Arc<AppState>>,
) -> LoopResult<Json<FeedbackStats>> {
    Ok(Json(state.control.monitoring.feedback_stats()?))
}

async fn recent_predictions(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> LoopResult<Json<Vec<WindowRecord>>> {
    let limit = query.limit.min(MAX_RECENT);
    Ok(Json(state.control.monitoring.recent_predictions(limit)?))
}

async fn recent_activity(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ActivityQuery>,
) -> LoopResult<Json<RecentActivity>> {
    Ok(Json(
        state
            .control
            .monitoring
            .recent_activity(query.hours, Utc::now())?,
    ))
}

async fn retrain(Extension(state): Extension<Arc<AppState>>) -> Json<RetrainingRun> {
    Json(state.control.run_retraining_if_triggered().await)
}

async fn jobs(Extension(state): Extension<Arc<AppState>>) -> LoopResult<Json<Vec<RetrainingJob>>> {
    Ok(Json(state.control.jobs()?))
}

async fn models(Extension(state): Extension<Arc<AppState>>) -> LoopResult<Json<Vec<ModelVersion>>> {
    Ok(Json(state.registry.versions()?))
}

async fn active_model(Extension(state): Extension<Arc<AppState>>) -> LoopResult<Json<ModelVersion>> {
    Ok(Json(state.control.get_active_model()?.metadata.clone()))
}

async fn rollback(
    Extension(state): Extension<Arc<AppState>>,
    Path(version): Path<String>,
) -> LoopResult<Json<ModelVersion>> {
    let active = state.control.rollback(&version)?;
    Ok(Json(active.metadata.clone()))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn readyz(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.registry.get_active() {
        Ok(active) => Json(serde_json::json!({ "ready": true, "active_version": active.version })),
        Err(_) => Json(serde_json::json!({ "ready": false })),
    }
}
