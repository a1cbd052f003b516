//! Drift statistics over model-confidence histograms.
//!
//! A `DriftStatistic` compares the reference histogram captured when the
//! active model was promoted against the histogram of the current window.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of equal-width bins over [0, 1].
pub const HISTOGRAM_BINS: usize = 10;

/// Added to every bin proportion so empty bins never produce `ln(0)`.
const SMOOTHING_EPSILON: f64 = 1e-4;

/// Counts of confidence values per bin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceHistogram {
    pub counts: Vec<u64>,
}

impl Default for ConfidenceHistogram {
    fn default() -> Self {
        Self {
            counts: vec![0; HISTOGRAM_BINS],
        }
    }
}

impl ConfidenceHistogram {
    pub fn from_confidences<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut histogram = Self::default();
        for value in values {
            histogram.add(value);
        }
        histogram
    }

    pub fn add(&mut self, confidence: f64) {
        if self.counts.len() != HISTOGRAM_BINS {
            self.counts.resize(HISTOGRAM_BINS, 0);
        }
        let clamped = confidence.clamp(0.0, 1.0);
        let bin = ((clamped * HISTOGRAM_BINS as f64).floor() as usize).min(HISTOGRAM_BINS - 1);
        self.counts[bin] += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Smoothed, renormalised bin proportions.
    pub fn proportions(&self) -> Vec<f64> {
        let total = self.total() as f64;
        let raw: Vec<f64> = (0..HISTOGRAM_BINS)
            .map(|i| {
                let count = self.counts.get(i).copied().unwrap_or(0) as f64;
                let p = if total > 0.0 { count / total } else { 0.0 };
                p + SMOOTHING_EPSILON
            })
            .collect();
        let norm: f64 = raw.iter().sum();
        raw.into_iter().map(|p| p / norm).collect()
    }
}

/// Single-method strategy for comparing two distributions.
pub trait DriftStatistic: Send + Sync {
    fn name(&self) -> &'static str;

    /// Distance between `reference` and `window`; 0 means identical.
    fn compute_drift(&self, reference: &ConfidenceHistogram, window: &ConfidenceHistogram) -> f64;
}

/// Population Stability Index: sum of (a - e) * ln(a / e).
#[derive(Debug, Clone, Copy, Default)]
pub struct PopulationStability;

impl DriftStatistic for PopulationStability {
    fn name(&self) -> &'static str {
        "psi"
    }

    fn compute_drift(&self, reference: &ConfidenceHistogram, window: &ConfidenceHistogram) -> f64 {
        if reference.is_empty() || window.is_empty() {
            return 0.0;
        }
        reference
            .proportions()
            .iter()
            .zip(window.proportions())
            .map(|(e, a)| (a - e) * (a / e).ln())
            .sum()
    }
}

/// KL(window || reference).
#[derive(Debug, Clone, Copy, Default)]
pub struct KlDivergence;

impl DriftStatistic for KlDivergence {
    fn name(&self) -> &'static str {
        "kl"
    }

    fn compute_drift(&self, reference: &ConfidenceHistogram, window: &ConfidenceHistogram) -> f64 {
        if reference.is_empty() || window.is_empty() {
            return 0.0;
        }
        reference
            .proportions()
            .iter()
            .zip(window.proportions())
            .map(|(e, a)| a * (a / e).ln())
            .sum::<f64>()
            .max(0.0)
    }
}

/// Configurable choice of statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftMethod {
    #[default]
    Psi,
    Kl,
}

impl DriftMethod {
    pub fn statistic(self) -> Box<dyn DriftStatistic> {
        match self {
            DriftMethod::Psi => Box::new(PopulationStability),
            DriftMethod::Kl => Box::new(KlDivergence),
        }
    }
}

impl fmt::Display for DriftMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftMethod::Psi => write!(f, "psi"),
            DriftMethod::Kl => write!(f, "kl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist(values: &[f64]) -> ConfidenceHistogram {
        ConfidenceHistogram::from_confidences(values.iter().copied())
    }

    #[test]
    fn binning_clamps_and_puts_one_in_last_bin() {
        let h = hist(&[0.0, 0.05, 0.55, 1.0, 1.7, -0.2]);
        assert_eq!(h.counts[0], 3);
        assert_eq!(h.counts[5], 1);
        assert_eq!(h.counts[9], 2);
        assert_eq!(h.total(), 6);
    }

    #[test]
    fn proportions_sum_to_one() {
        let p = hist(&[0.9, 0.91, 0.6]).proportions();
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn identical_distributions_have_zero_drift() {
        let a = hist(&[0.55, 0.65, 0.75, 0.95, 0.95]);
        assert!(PopulationStability.compute_drift(&a, &a).abs() < 1e-12);
        assert!(KlDivergence.compute_drift(&a, &a).abs() < 1e-12);
    }

    #[test]
    fn shifted_distribution_scores_above_threshold() {
        let reference = hist(&[0.95; 50]);
        let window = hist(&[0.55; 50]);
        assert!(PopulationStability.compute_drift(&reference, &window) > 0.2);
        assert!(KlDivergence.compute_drift(&reference, &window) > 0.2);
    }

    #[test]
    fn psi_is_symmetric_kl_is_not_required_to_be() {
        let a = hist(&[0.95, 0.95, 0.85, 0.65]);
        let b = hist(&[0.55, 0.65, 0.65, 0.95]);
        let psi_ab = PopulationStability.compute_drift(&a, &b);
        let psi_ba = PopulationStability.compute_drift(&b, &a);
        assert!((psi_ab - psi_ba).abs() < 1e-12);
    }

    #[test]
    fn empty_side_yields_zero() {
        let a = hist(&[0.9]);
        let empty = ConfidenceHistogram::default();
        assert_eq!(PopulationStability.compute_drift(&a, &empty), 0.0);
        assert_eq!(KlDivergence.compute_drift(&empty, &a), 0.0);
    }
}
