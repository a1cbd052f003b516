//! Retraining trigger: a pure decision over the latest snapshot, elapsed time
//! and configuration. The only state is the last fire timestamp.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

use crate::config::ControlLoopConfig;
use crate::drift_snapshot::DriftSnapshot;
use crate::errors::{LoopResult, SafeLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerReason {
    Drift,
    Accuracy,
    Schedule,
    None,
    InsufficientData,
    Cooldown,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerReason::Drift => "DRIFT",
            TriggerReason::Accuracy => "ACCURACY",
            TriggerReason::Schedule => "SCHEDULE",
            TriggerReason::None => "NONE",
            TriggerReason::InsufficientData => "INSUFFICIENT_DATA",
            TriggerReason::Cooldown => "COOLDOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDecision {
    pub fire: bool,
    pub reason: TriggerReason,
    pub evaluated_at: DateTime<Utc>,
    pub detail: String,
}

impl TriggerDecision {
    fn hold(reason: TriggerReason, at: DateTime<Utc>, detail: String) -> Self {
        Self {
            fire: false,
            reason,
            evaluated_at: at,
            detail,
        }
    }

    fn fire(reason: TriggerReason, at: DateTime<Utc>, detail: String) -> Self {
        Self {
            fire: true,
            reason,
            evaluated_at: at,
            detail,
        }
    }
}

/// Thresholds the trigger reads from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerPolicy {
    pub drift_threshold: f64,
    pub accuracy_floor: f64,
    pub schedule_interval: Duration,
    pub cooldown_period: Duration,
    pub min_sample_count: usize,
}

impl From<&ControlLoopConfig> for TriggerPolicy {
    fn from(cfg: &ControlLoopConfig) -> Self {
        Self {
            drift_threshold: cfg.drift_threshold,
            accuracy_floor: cfg.accuracy_floor,
            schedule_interval: cfg.schedule_interval(),
            cooldown_period: cfg.cooldown_period(),
            min_sample_count: cfg.min_sample_count,
        }
    }
}

/// Decide whether to retrain.
///
/// Order: cooldown, insufficient data, drift, accuracy, schedule. Before the
/// first fire the schedule is measured from `anchor`.
pub fn decide(
    snapshot: &DriftSnapshot,
    last_fire: Option<DateTime<Utc>>,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: &TriggerPolicy,
) -> TriggerDecision {
    if let Some(fired_at) = last_fire {
        let since = now - fired_at;
        if since < policy.cooldown_period {
            return TriggerDecision::hold(
                TriggerReason::Cooldown,
                now,
                format!(
                    "last fire {}s ago, cooldown {}s",
                    since.num_seconds(),
                    policy.cooldown_period.num_seconds()
                ),
            );
        }
    }

    if snapshot.sample_count < policy.min_sample_count {
        return TriggerDecision::hold(
            TriggerReason::InsufficientData,
            now,
            format!(
                "{} feedback samples, {} required",
                snapshot.sample_count, policy.min_sample_count
            ),
        );
    }

    if snapshot.drift_score > policy.drift_threshold {
        return TriggerDecision::fire(
            TriggerReason::Drift,
            now,
            format!(
                "drift_score {:.4} > {:.4}",
                snapshot.drift_score, policy.drift_threshold
            ),
        );
    }

    if let Some(accuracy) = snapshot.accuracy {
        if accuracy < policy.accuracy_floor {
            return TriggerDecision::fire(
                TriggerReason::Accuracy,
                now,
                format!("accuracy {accuracy:.4} < {:.4}", policy.accuracy_floor),
            );
        }
    }

    let elapsed = now - last_fire.unwrap_or(anchor);
    if elapsed >= policy.schedule_interval {
        return TriggerDecision::fire(
            TriggerReason::Schedule,
            now,
            format!(
                "{}s since last retraining, interval {}s",
                elapsed.num_seconds(),
                policy.schedule_interval.num_seconds()
            ),
        );
    }

    TriggerDecision::hold(TriggerReason::None, now, "all metrics within bounds".into())
}

/// Stateful wrapper around [`decide`] remembering when it last fired.
pub struct RetrainingTrigger {
    policy: TriggerPolicy,
    anchor: DateTime<Utc>,
    last_fire: Mutex<Option<DateTime<Utc>>>,
}

impl RetrainingTrigger {
    pub fn new(policy: TriggerPolicy, anchor: DateTime<Utc>) -> Self {
        Self {
            policy,
            anchor,
            last_fire: Mutex::new(None),
        }
    }

    /// Resume with a fire time recovered from the audit trail.
    pub fn with_last_fire(self, last_fire: Option<DateTime<Utc>>) -> Self {
        Self {
            last_fire: Mutex::new(last_fire),
            ..self
        }
    }

    pub fn policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    pub fn last_fire(&self) -> LoopResult<Option<DateTime<Utc>>> {
        Ok(*self.last_fire.safe_lock()?)
    }

    /// Decide and, when firing, start the cooldown.
    pub fn evaluate(&self, snapshot: &DriftSnapshot, now: DateTime<Utc>) -> LoopResult<TriggerDecision> {
        let mut last = self.last_fire.safe_lock()?;
        let decision = decide(snapshot, *last, self.anchor, now, &self.policy);
        if decision.fire {
            *last = Some(now);
            tracing::info!(reason = %decision.reason, detail = %decision.detail, "retraining trigger fired");
        } else {
            tracing::debug!(reason = %decision.reason, detail = %decision.detail, "retraining trigger held");
        }
        Ok(decision)
    }

    /// Decide without recording a fire.
    pub fn peek(&self, snapshot: &DriftSnapshot, now: DateTime<Utc>) -> LoopResult<TriggerDecision> {
        let last = self.last_fire.safe_lock()?;
        Ok(decide(snapshot, *last, self.anchor, now, &self.policy))
    }
}
