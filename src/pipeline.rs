//! Fixed feature + model pipeline: hashed bag-of-words into a logistic model.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{LoopError, LoopResult};
use crate::records::Sentiment;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// A text with its training label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledExample {
    pub text: String,
    pub label: Sentiment,
}

impl LabeledExample {
    pub fn new(text: impl Into<String>, label: Sentiment) -> Self {
        Self {
            text: text.into(),
            label,
        }
    }
}

/// Shared cancellation signal checked by the pipeline between epochs.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, stage: &str) -> LoopResult<()> {
        if self.is_cancelled() {
            return Err(LoopError::cancelled(format!("cancelled during {stage}")));
        }
        Ok(())
    }
}

/// Hyperparameters; stored with every artifact so a model can be reproduced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub buckets: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub l2: f64,
    pub seed: u64,
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self {
            buckets: 4096,
            epochs: 30,
            learning_rate: 0.5,
            l2: 1e-4,
            seed: 7,
        }
    }
}

/// Label plus calibrated confidence for one text.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scored {
    pub label: Sentiment,
    /// max(p, 1 - p)
    pub confidence: f64,
    /// P(positive)
    pub probability: f64,
}

/// Serialized model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentModel {
    pub pipeline: String,
    pub spec: PipelineSpec,
    pub bias: f64,
    pub weights: Vec<f64>,
}

impl SentimentModel {
    pub fn probability(&self, text: &str) -> f64 {
        let features = featurize(text, self.spec.buckets);
        sigmoid(self.linear(&features))
    }

    pub fn score(&self, text: &str) -> Scored {
        let probability = self.probability(text);
        let label = if probability >= 0.5 {
            Sentiment::Positive
        } else {
            Sentiment::Negative
        };
        Scored {
            label,
            confidence: probability.max(1.0 - probability),
            probability,
        }
    }

    fn linear(&self, features: &[(usize, f64)]) -> f64 {
        self.bias
            + features
                .iter()
                .map(|(idx, value)| self.weights.get(*idx).copied().unwrap_or(0.0) * value)
                .sum::<f64>()
    }
}

/// Trains a model from labeled examples.
pub trait TrainingPipeline: Send + Sync {
    fn name(&self) -> String;

    fn fit(&self, examples: &[LabeledExample], cancel: &CancelFlag) -> LoopResult<SentimentModel>;
}

/// Hashed-features logistic regression trained with seeded SGD.
#[derive(Debug, Clone, Default)]
pub struct LinearPipeline {
    spec: PipelineSpec,
}

impl LinearPipeline {
    pub fn new(spec: PipelineSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }
}

impl TrainingPipeline for LinearPipeline {
    fn name(&self) -> String {
        format!("hashed-logistic/{}", self.spec.buckets)
    }

    fn fit(&self, examples: &[LabeledExample], cancel: &CancelFlag) -> LoopResult<SentimentModel> {
        if examples.is_empty() {
            return Err(LoopError::training("fit", "training set is empty"));
        }
        if self.spec.buckets == 0 {
            return Err(LoopError::training("fit", "pipeline has zero feature buckets"));
        }

        let rows: Vec<(Vec<(usize, f64)>, f64)> = examples
            .iter()
            .map(|ex| (featurize(&ex.text, self.spec.buckets), ex.label.as_target()))
            .collect();

        let mut model = SentimentModel {
            pipeline: self.name(),
            spec: self.spec,
            bias: 0.0,
            weights: vec![0.0; self.spec.buckets],
        };

        let mut rng = StdRng::seed_from_u64(self.spec.seed);
        let mut order: Vec<usize> = (0..rows.len()).collect();

        for epoch in 0..self.spec.epochs {
            cancel.check(&format!("epoch {epoch}"))?;
            order.shuffle(&mut rng);
            // 1/sqrt(t) decay keeps late epochs from oscillating
            let lr = self.spec.learning_rate / ((epoch + 1) as f64).sqrt();

            for &i in &order {
                let (features, target) = &rows[i];
                let gradient = sigmoid(model.linear(features)) - target;
                for (idx, value) in features {
                    let w = &mut model.weights[*idx];
                    *w -= lr * (gradient * value + self.spec.l2 * *w);
                }
                model.bias -= lr * gradient;
            }
        }

        if !model.bias.is_finite() || model.weights.iter().any(|w| !w.is_finite()) {
            return Err(LoopError::training("fit", "weights diverged"));
        }

        tracing::debug!(
            examples = examples.len(),
            epochs = self.spec.epochs,
            "pipeline fit complete"
        );
        Ok(model)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Lowercased alphanumeric word runs.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Unigrams and bigrams hashed into `buckets`, L2-normalised.
fn featurize(text: &str, buckets: usize) -> Vec<(usize, f64)> {
    if buckets == 0 {
        return Vec::new();
    }
    let tokens = tokenize(text);
    let mut counts: std::collections::BTreeMap<usize, f64> = std::collections::BTreeMap::new();

    let mut bump = |feature: &str| {
        let idx = (fnv1a(feature.as_bytes()) % buckets as u64) as usize;
        *counts.entry(idx).or_insert(0.0) += 1.0;
    };
    for token in &tokens {
        bump(token);
    }
    for pair in tokens.windows(2) {
        bump(&format!("{}_{}", pair[0], pair[1]));
    }

    let norm = counts.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm == 0.0 {
        return Vec::new();
    }
    counts.into_iter().map(|(i, v)| (i, v / norm)).collect()
}
