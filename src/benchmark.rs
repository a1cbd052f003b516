//! Fixed regression benchmark every candidate is scored against.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::errors::{LoopError, LoopResult};
use crate::pipeline::LabeledExample;
use crate::records::Sentiment;

const BUILTIN: &[(&str, Sentiment)] = &[
    ("the product is great and works perfectly", Sentiment::Positive),
    ("i love this, excellent quality for the price", Sentiment::Positive),
    ("fast delivery and very friendly service", Sentiment::Positive),
    ("amazing experience, would buy again", Sentiment::Positive),
    ("the app is helpful and easy to use", Sentiment::Positive),
    ("very satisfied with the result, good job", Sentiment::Positive),
    ("the staff were kind and the food was delicious", Sentiment::Positive),
    ("best purchase this year, highly recommended", Sentiment::Positive),
    ("clean room, comfortable bed, nice view", Sentiment::Positive),
    ("the update made everything faster and smoother", Sentiment::Positive),
    ("good value and the packaging was neat", Sentiment::Positive),
    ("happy with the support team, they solved it quickly", Sentiment::Positive),
    ("the product is bad and broke after one day", Sentiment::Negative),
    ("i hate this, terrible quality for the price", Sentiment::Negative),
    ("slow delivery and very rude service", Sentiment::Negative),
    ("awful experience, never buying again", Sentiment::Negative),
    ("the app is confusing and crashes constantly", Sentiment::Negative),
    ("very disappointed with the result, poor job", Sentiment::Negative),
    ("the staff were rude and the food was cold", Sentiment::Negative),
    ("worst purchase this year, do not recommend", Sentiment::Negative),
    ("dirty room, uncomfortable bed, noisy street", Sentiment::Negative),
    ("the update made everything slower and buggy", Sentiment::Negative),
    ("overpriced and the packaging was damaged", Sentiment::Negative),
    ("the support team ignored me for weeks", Sentiment::Negative),
];

/// A labeled, never-changing evaluation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSet {
    pub name: String,
    pub examples: Vec<LabeledExample>,
}

impl BenchmarkSet {
    pub fn builtin() -> Self {
        Self {
            name: "builtin".to_string(),
            examples: BUILTIN
                .iter()
                .map(|(text, label)| LabeledExample::new(*text, *label))
                .collect(),
        }
    }

    /// Load a JSON array of `{ "text": .., "label": "positive" | "negative" }`.
    pub fn load(path: impl AsRef<Path>) -> LoopResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| LoopError::io("read benchmark", e))?;
        let examples: Vec<LabeledExample> = serde_json::from_str(&raw)
            .map_err(|e| LoopError::serialization("parse benchmark", e))?;
        if examples.is_empty() {
            return Err(LoopError::config(format!(
                "benchmark {} contains no examples",
                path.display()
            )));
        }
        Ok(Self {
            name: path.display().to_string(),
            examples,
        })
    }

    /// Configured file, or the built-in set.
    pub fn from_config(path: Option<&str>) -> LoopResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::builtin()),
        }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}
