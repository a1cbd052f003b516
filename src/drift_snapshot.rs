use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a monitoring cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    Ok,
    /// Fewer feedback entries than `min_sample_count`; accuracy is undefined
    InsufficientData,
    /// The feedback log could not be read; the cycle was skipped
    StoreUnavailable,
    Failed,
}

/// First and last prediction covered by a window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub first_prediction_id: Option<u64>,
    pub last_prediction_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
}

/// Read-only summary of one monitoring window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSnapshot {
    pub computed_at: DateTime<Utc>,
    pub status: SnapshotStatus,
    pub window: WindowBounds,
    pub accuracy: Option<f64>,
    pub feedback_ratio: f64,
    pub drift_score: f64,
    pub drift_statistic: String,
    /// Feedback entries in the window
    pub sample_count: usize,
    pub prediction_count: usize,
    pub latency: LatencyPercentiles,
    /// Version whose reference histogram the drift was measured against
    pub reference_version: Option<String>,
    pub error: Option<String>,
}

impl DriftSnapshot {
    /// Snapshot for a cycle that never got to read the window.
    pub fn unavailable(
        computed_at: DateTime<Utc>,
        status: SnapshotStatus,
        error: impl Into<String>,
    ) -> Self {
        Self {
            computed_at,
            status,
            window: WindowBounds::default(),
            accuracy: None,
            feedback_ratio: 0.0,
            drift_score: 0.0,
            drift_statistic: String::new(),
            sample_count: 0,
            prediction_count: 0,
            latency: LatencyPercentiles::default(),
            reference_version: None,
            error: Some(error.into()),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(
            self.status,
            SnapshotStatus::StoreUnavailable | SnapshotStatus::Failed
        )
    }
}
