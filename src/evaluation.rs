use crate::drift::ConfidenceHistogram;
use crate::model_version::EvalMetrics;
use crate::pipeline::{LabeledExample, SentimentModel};
use crate::records::Sentiment;

/// Metrics and confidence distribution of a model over one example set.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub metrics: EvalMetrics,
    pub histogram: ConfidenceHistogram,
}

/// Score every example; positive is the reference class for P/R/F1.
pub fn evaluate(model: &SentimentModel, examples: &[LabeledExample]) -> Evaluation {
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut tn = 0usize;
    let mut fn_ = 0usize;
    let mut histogram = ConfidenceHistogram::default();

    for example in examples {
        let scored = model.score(&example.text);
        histogram.add(scored.confidence);
        match (scored.label, example.label) {
            (Sentiment::Positive, Sentiment::Positive) => tp += 1,
            (Sentiment::Positive, Sentiment::Negative) => fp += 1,
            (Sentiment::Negative, Sentiment::Negative) => tn += 1,
            (Sentiment::Negative, Sentiment::Positive) => fn_ += 1,
        }
    }

    Evaluation {
        metrics: metrics_from_counts(tp, fp, tn, fn_),
        histogram,
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn metrics_from_counts(tp: usize, fp: usize, tn: usize, fn_: usize) -> EvalMetrics {
    let support = tp + fp + tn + fn_;
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    EvalMetrics {
        accuracy: ratio(tp + tn, support),
        precision,
        recall,
        f1,
        support,
    }
}
