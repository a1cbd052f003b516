//! Monitoring engine: read a window from the feedback log and summarise it.
//!
//! [`compute_snapshot`] is a pure function of the window contents, so equal
//! windows always give equal snapshots. [`MonitoringEngine`] wraps it with
//! the store read and remembers the latest result.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use crate::drift::{ConfidenceHistogram, DriftStatistic};
use crate::drift_snapshot::{DriftSnapshot, LatencyPercentiles, SnapshotStatus, WindowBounds};
use crate::errors::{LoopError, LoopResult, SafeReadLock, SafeWriteLock};
use crate::feedback_store::FeedbackStore;
use crate::records::{FeedbackStats, VersionMetrics, WindowRecord, WindowSpec};

/// Longest look-back accepted by [`MonitoringEngine::recent_activity`].
pub const MAX_ACTIVITY_HOURS: u32 = 24 * 365;

/// Source of the drift baseline captured at the last promotion.
pub trait ReferenceProvider: Send + Sync {
    /// `(version, histogram)` of the active model, if it has one.
    fn reference(&self) -> LoopResult<Option<(String, ConfidenceHistogram)>>;
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Summarise `records` against an optional reference histogram.
pub fn compute_snapshot(
    records: &[WindowRecord],
    reference: Option<(&str, &ConfidenceHistogram)>,
    statistic: &dyn DriftStatistic,
    min_sample_count: usize,
    computed_at: DateTime<Utc>,
) -> DriftSnapshot {
    let prediction_count = records.len();
    let mut sample_count = 0usize;
    let mut correct = 0usize;
    let mut latencies = Vec::with_capacity(prediction_count);
    let mut window_hist = ConfidenceHistogram::default();

    for r in records {
        if let Some(ok) = r.prediction.feedback_correct {
            sample_count += 1;
            if ok {
                correct += 1;
            }
        }
        latencies.push(r.prediction.latency_ms);
        window_hist.add(r.prediction.confidence);
    }
    latencies.sort_by(|a, b| a.total_cmp(b));

    let enough = sample_count >= min_sample_count && sample_count > 0;
    let accuracy = enough.then(|| correct as f64 / sample_count as f64);
    let feedback_ratio = if prediction_count == 0 {
        0.0
    } else {
        sample_count as f64 / prediction_count as f64
    };
    let drift_score = reference
        .map(|(_, hist)| statistic.compute_drift(hist, &window_hist))
        .unwrap_or(0.0);

    let window = WindowBounds {
        start: records.iter().map(|r| r.prediction.timestamp).min(),
        end: records.iter().map(|r| r.prediction.timestamp).max(),
        first_prediction_id: records.first().map(|r| r.prediction.id),
        last_prediction_id: records.last().map(|r| r.prediction.id),
    };

    DriftSnapshot {
        computed_at,
        status: if enough {
            SnapshotStatus::Ok
        } else {
            SnapshotStatus::InsufficientData
        },
        window,
        accuracy,
        feedback_ratio,
        drift_score,
        drift_statistic: statistic.name().to_string(),
        sample_count,
        prediction_count,
        latency: LatencyPercentiles {
            p50_ms: percentile(&latencies, 0.50),
            p95_ms: percentile(&latencies, 0.95),
        },
        reference_version: reference.map(|(v, _)| v.to_string()),
        error: None,
    }
}

/// Prediction volume over a trailing time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentActivity {
    pub since: DateTime<Utc>,
    pub total_predictions: usize,
    pub avg_confidence: f64,
    pub avg_latency_ms: f64,
    pub models_used: Vec<String>,
}

pub fn summarize_activity(records: &[WindowRecord], since: DateTime<Utc>) -> RecentActivity {
    let n = records.len();
    let models: BTreeSet<&str> = records
        .iter()
        .map(|r| r.prediction.model_version.as_str())
        .collect();
    let mean = |f: fn(&WindowRecord) -> f64| {
        if n == 0 {
            0.0
        } else {
            records.iter().map(f).sum::<f64>() / n as f64
        }
    };
    RecentActivity {
        since,
        total_predictions: n,
        avg_confidence: mean(|r| r.prediction.confidence),
        avg_latency_ms: mean(|r| r.prediction.latency_ms),
        models_used: models.into_iter().map(String::from).collect(),
    }
}

pub struct MonitoringEngine {
    store: Arc<dyn FeedbackStore>,
    reference: Arc<dyn ReferenceProvider>,
    statistic: Box<dyn DriftStatistic>,
    window: usize,
    min_sample_count: usize,
    latest: RwLock<Option<DriftSnapshot>>,
}

impl MonitoringEngine {
    pub fn new(
        store: Arc<dyn FeedbackStore>,
        reference: Arc<dyn ReferenceProvider>,
        statistic: Box<dyn DriftStatistic>,
        window: usize,
        min_sample_count: usize,
    ) -> Self {
        Self {
            store,
            reference,
            statistic,
            window,
            min_sample_count,
            latest: RwLock::new(None),
        }
    }

    /// Read the latest window and summarise it. Store failures become a
    /// skipped snapshot instead of an error.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> DriftSnapshot {
        let snapshot = match self.read_and_compute(now) {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_transient() => {
                tracing::warn!("monitoring cycle skipped, feedback store unavailable: {e}");
                DriftSnapshot::unavailable(now, SnapshotStatus::StoreUnavailable, e.to_string())
            }
            Err(e) => {
                tracing::error!("monitoring cycle failed: {e}");
                DriftSnapshot::unavailable(now, SnapshotStatus::Failed, e.to_string())
            }
        };

        tracing::info!(
            status = ?snapshot.status,
            accuracy = ?snapshot.accuracy,
            drift_score = snapshot.drift_score,
            sample_count = snapshot.sample_count,
            prediction_count = snapshot.prediction_count,
            "monitoring snapshot"
        );

        match self.latest.safe_write() {
            Ok(mut latest) => *latest = Some(snapshot.clone()),
            Err(e) => tracing::warn!("could not cache snapshot: {e}"),
        }
        snapshot
    }

    fn read_and_compute(&self, now: DateTime<Utc>) -> LoopResult<DriftSnapshot> {
        let records = self.store.query_window(WindowSpec::Latest(self.window))?;
        let reference = self.reference.reference()?;
        Ok(compute_snapshot(
            &records,
            reference.as_ref().map(|(v, h)| (v.as_str(), h)),
            self.statistic.as_ref(),
            self.min_sample_count,
            now,
        ))
    }

    pub fn latest(&self) -> LoopResult<Option<DriftSnapshot>> {
        Ok(self.latest.safe_read()?.clone())
    }

    /// Per-version prediction aggregates for comparing model versions.
    pub fn metrics_by_version(&self) -> LoopResult<Vec<VersionMetrics>> {
        self.store.prediction_counts_by_version()
    }

    pub fn feedback_stats(&self) -> LoopResult<FeedbackStats> {
        self.store.feedback_stats()
    }

    pub fn recent_predictions(&self, limit: usize) -> LoopResult<Vec<WindowRecord>> {
        self.store.recent_predictions(limit)
    }

    /// Activity over the last `hours`, read as a time-bounded window.
    pub fn recent_activity(&self, hours: u32, now: DateTime<Utc>) -> LoopResult<RecentActivity> {
        if hours == 0 || hours > MAX_ACTIVITY_HOURS {
            return Err(LoopError::validation(
                "hours",
                format!("must be within 1..={MAX_ACTIVITY_HOURS}"),
            ));
        }
        let since = now - Duration::hours(i64::from(hours));
        let records = self.store.query_window(WindowSpec::Since(since))?;
        Ok(summarize_activity(&records, since))
    }
}
