//! Promotion gate for trained candidates.

use chrono::Utc;

use crate::config::ControlLoopConfig;
use crate::model_version::{ScoreCard, ValidationReport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationPolicy {
    /// Allowed drop versus the active version
    pub promotion_epsilon: f64,
    pub accuracy_floor: f64,
    pub min_f1: f64,
}

impl From<&ControlLoopConfig> for ValidationPolicy {
    fn from(cfg: &ControlLoopConfig) -> Self {
        Self {
            promotion_epsilon: cfg.promotion_epsilon,
            accuracy_floor: cfg.accuracy_floor,
            min_f1: cfg.min_f1,
        }
    }
}

/// The active model's scores on the candidate's own evaluation sets.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub version: String,
    pub scores: ScoreCard,
}

pub struct ModelValidator {
    policy: ValidationPolicy,
}

impl ModelValidator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Every failed check is listed; the candidate passes only with none.
    pub fn validate(&self, candidate: &ScoreCard, baseline: Option<&Baseline>) -> ValidationReport {
        let p = &self.policy;
        let mut reasons = Vec::new();

        if let Some(base) = baseline {
            let floor = base.scores.test.accuracy - p.promotion_epsilon;
            if candidate.test.accuracy < floor {
                reasons.push(format!(
                    "test accuracy {:.4} < {} accuracy {:.4} - epsilon {:.4}",
                    candidate.test.accuracy, base.version, base.scores.test.accuracy, p.promotion_epsilon
                ));
            }
            let bench_floor = base.scores.benchmark.accuracy - p.promotion_epsilon;
            if candidate.benchmark.accuracy < bench_floor {
                reasons.push(format!(
                    "benchmark accuracy {:.4} < {} benchmark accuracy {:.4} - epsilon {:.4}",
                    candidate.benchmark.accuracy,
                    base.version,
                    base.scores.benchmark.accuracy,
                    p.promotion_epsilon
                ));
            }
        }

        if candidate.test.accuracy < p.accuracy_floor {
            reasons.push(format!(
                "test accuracy {:.4} below floor {:.4}",
                candidate.test.accuracy, p.accuracy_floor
            ));
        }
        if candidate.test.f1 < p.min_f1 {
            reasons.push(format!(
                "test f1 {:.4} below minimum {:.4}",
                candidate.test.f1, p.min_f1
            ));
        }

        ValidationReport {
            passed: reasons.is_empty(),
            compared_to: baseline.map(|b| b.version.clone()),
            reasons,
            checked_at: Utc::now(),
        }
    }
}
