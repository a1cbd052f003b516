use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::trigger::TriggerReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    Success,
    ValidationRejected,
    Failed,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobOutcome::Success => "SUCCESS",
            JobOutcome::ValidationRejected => "VALIDATION_REJECTED",
            JobOutcome::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One end-to-end retraining attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainingJob {
    pub id: String,
    pub trigger_reason: TriggerReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: JobOutcome,
    /// Candidate produced by the run, if training got that far
    pub model_version: Option<String>,
    pub records_consumed: usize,
    pub message: String,
}

impl RetrainingJob {
    pub(crate) fn start(trigger_reason: TriggerReason, at: DateTime<Utc>) -> JobBuilder {
        JobBuilder {
            id: Uuid::new_v4().to_string(),
            trigger_reason,
            started_at: at,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// A job that has started but not reached a terminal state.
#[derive(Debug, Clone)]
pub(crate) struct JobBuilder {
    pub id: String,
    pub trigger_reason: TriggerReason,
    pub started_at: DateTime<Utc>,
}

impl JobBuilder {
    pub fn finish(
        self,
        outcome: JobOutcome,
        model_version: Option<String>,
        records_consumed: usize,
        message: impl Into<String>,
    ) -> RetrainingJob {
        RetrainingJob {
            id: self.id,
            trigger_reason: self.trigger_reason,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            model_version,
            records_consumed,
            message: message.into(),
        }
    }

    pub fn failed(self, model_version: Option<String>, message: impl Into<String>) -> RetrainingJob {
        self.finish(JobOutcome::Failed, model_version, 0, message)
    }
}
