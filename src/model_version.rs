//! Model version metadata and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::drift::ConfidenceHistogram;

/// Lifecycle status of a model version.
///
/// `Candidate -> Active | Rejected`, `Active -> Archived`, `Archived -> Active`
/// (rollback only). `Rejected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStatus {
    Candidate,
    Active,
    Archived,
    Rejected,
}

impl ModelStatus {
    pub fn can_transition_to(self, next: ModelStatus) -> bool {
        matches!(
            (self, next),
            (ModelStatus::Candidate, ModelStatus::Active)
                | (ModelStatus::Candidate, ModelStatus::Rejected)
                | (ModelStatus::Active, ModelStatus::Archived)
                | (ModelStatus::Archived, ModelStatus::Active)
        )
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelStatus::Candidate => "CANDIDATE",
            ModelStatus::Active => "ACTIVE",
            ModelStatus::Archived => "ARCHIVED",
            ModelStatus::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Classification metrics on one evaluation set (positive class for P/R/F1).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Held-out test split and fixed benchmark metrics, side by side.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreCard {
    pub test: EvalMetrics,
    pub benchmark: EvalMetrics,
}

/// Which records a version was trained on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainingWindow {
    /// Records in the cumulative corpus before this run
    pub prior_corpus: usize,
    /// Records newly drawn into training by this run
    pub new_records: usize,
    pub train_count: usize,
    pub test_count: usize,
    pub split_seed: u64,
    pub split_ratio: f64,
    pub first_prediction_id: Option<u64>,
    pub last_prediction_id: Option<u64>,
}

/// Location and checksum of a serialized model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    pub sha256: String,
}

/// Outcome of the promotion gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub compared_to: Option<String>,
    pub reasons: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn summary(&self) -> String {
        if self.passed {
            "all checks passed".to_string()
        } else {
            self.reasons.join("; ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub status: ModelStatus,
    pub training_window: TrainingWindow,
    pub metrics: ScoreCard,
    /// Confidence distribution on the evaluation set; drift baseline once active
    pub reference_histogram: ConfidenceHistogram,
    pub artifact: ArtifactRef,
    pub pipeline: String,
    pub validation: Option<ValidationReport>,
    pub trigger_reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl ModelVersion {
    /// Numeric part of a `v<N>` tag.
    pub fn sequence(&self) -> u64 {
        parse_sequence(&self.version).unwrap_or(0)
    }
}

pub fn parse_sequence(tag: &str) -> Option<u64> {
    tag.strip_prefix('v')?.parse().ok()
}

pub fn version_tag(sequence: u64) -> String {
    format!("v{sequence}")
}

/// Persisted registry state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryManifest {
    pub active: String,
    pub versions: Vec<ModelVersion>,
    pub updated_at: DateTime<Utc>,
}
