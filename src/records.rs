//! Feedback log record types: inputs, predictions and the joined window view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Binary sentiment label produced by the serving model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
}

impl Sentiment {
    /// The other label; a negative feedback on a binary prediction implies it.
    pub fn opposite(self) -> Self {
        match self {
            Sentiment::Positive => Sentiment::Negative,
            Sentiment::Negative => Sentiment::Positive,
        }
    }

    pub fn as_target(self) -> f64 {
        match self {
            Sentiment::Positive => 1.0,
            Sentiment::Negative => 0.0,
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sentiment::Positive => write!(f, "positive"),
            Sentiment::Negative => write!(f, "negative"),
        }
    }
}

impl FromStr for Sentiment {
    type Err = ();

    fn from_str(input: &str) -> Result<Sentiment, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "positive" | "pos" => Ok(Sentiment::Positive),
            "negative" | "neg" => Ok(Sentiment::Negative),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingSplit {
    Train,
    Test,
}

/// A user input as logged at inference time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub consent: bool,
    pub anonymized: bool,
}

/// Input fields supplied by the caller; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewInput {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub consent: bool,
    pub anonymized: bool,
}

/// A model prediction plus its (optional) feedback and training bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: u64,
    pub input_id: u64,
    pub model_version: String,
    pub prediction: Sentiment,
    pub confidence: f64,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub feedback_correct: Option<bool>,
    pub feedback_timestamp: Option<DateTime<Utc>>,
    pub used_for_training: bool,
    pub training_split: Option<TrainingSplit>,
}

impl PredictionRecord {
    pub fn has_feedback(&self) -> bool {
        self.feedback_correct.is_some()
    }

    /// The label implied by the user's feedback, if any.
    pub fn feedback_label(&self) -> Option<Sentiment> {
        self.feedback_correct.map(|correct| {
            if correct {
                self.prediction
            } else {
                self.prediction.opposite()
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewPrediction {
    pub input_id: u64,
    pub model_version: String,
    pub prediction: Sentiment,
    pub confidence: f64,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// A prediction joined with the input it was made for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub prediction: PredictionRecord,
    pub input: InputRecord,
}

/// Which slice of the feedback log a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSpec {
    /// The most recent `n` predictions
    Latest(usize),
    /// Every prediction at or after the timestamp
    Since(DateTime<Utc>),
}

/// Which records the orchestrator may draw into a training batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EligibilityPolicy {
    pub include_unlabeled: bool,
    pub pseudo_label_min_confidence: f64,
}

impl EligibilityPolicy {
    pub fn admits(&self, record: &WindowRecord) -> bool {
        if record.prediction.used_for_training || !record.input.consent {
            return false;
        }
        if record.prediction.has_feedback() {
            return true;
        }
        self.include_unlabeled
            && record.input.anonymized
            && record.prediction.confidence >= self.pseudo_label_min_confidence
    }
}

/// Feedback totals over the whole log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total_predictions: usize,
    pub with_feedback: usize,
    /// Feedback confirming the prediction
    pub positive_feedback: usize,
    pub negative_feedback: usize,
}

impl FeedbackStats {
    pub fn count(&mut self, prediction: &PredictionRecord) {
        self.total_predictions += 1;
        match prediction.feedback_correct {
            Some(true) => {
                self.with_feedback += 1;
                self.positive_feedback += 1;
            }
            Some(false) => {
                self.with_feedback += 1;
                self.negative_feedback += 1;
            }
            None => {}
        }
    }

    pub fn feedback_ratio(&self) -> f64 {
        if self.total_predictions == 0 {
            0.0
        } else {
            self.with_feedback as f64 / self.total_predictions as f64
        }
    }
}

/// Aggregates per model version, for the version comparison report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetrics {
    pub model_version: String,
    pub prediction_count: usize,
    pub avg_confidence: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
}
