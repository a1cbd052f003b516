use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, IVec, Tree};
use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::errors::{LoopError, LoopResult};
use crate::feedback_store::FeedbackStore;
use crate::records::{
    EligibilityPolicy, FeedbackStats, InputRecord, NewInput, NewPrediction, PredictionRecord, TrainingSplit,
    VersionMetrics, WindowRecord, WindowSpec,
};

const INPUTS_TREE: &str = "inputs";
const PREDICTIONS_TREE: &str = "predictions";

fn key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn encode<T: Serialize>(value: &T) -> LoopResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| LoopError::serialization("encode record", e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> LoopResult<T> {
    serde_json::from_slice(bytes).map_err(|e| LoopError::serialization("decode record", e))
}

/// A sled-backed feedback log with one tree per logical table.
pub struct SledFeedbackStore {
    db: Db,
    inputs: Tree,
    predictions: Tree,
}

impl SledFeedbackStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> LoopResult<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            LoopError::store_unavailable(format!(
                "failed to open feedback log at {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_db(db)
    }

    /// In-memory store that disappears on drop.
    pub fn temporary() -> LoopResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> LoopResult<Self> {
        let inputs = db.open_tree(INPUTS_TREE)?;
        let predictions = db.open_tree(PREDICTIONS_TREE)?;
        Ok(Self {
            db,
            inputs,
            predictions,
        })
    }

    fn load_input(&self, input_id: u64) -> LoopResult<Option<InputRecord>> {
        match self.inputs.get(key(input_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn join(&self, prediction: PredictionRecord) -> LoopResult<Option<WindowRecord>> {
        Ok(self
            .load_input(prediction.input_id)?
            .map(|input| WindowRecord { prediction, input }))
    }

    fn all_predictions(&self) -> impl Iterator<Item = LoopResult<PredictionRecord>> + '_ {
        self.predictions.iter().map(|item| {
            let (_, value) = item?;
            decode::<PredictionRecord>(&value)
        })
    }

    /// Read-modify-write a prediction with compare-and-swap until it sticks.
    ///
    /// `apply` returns `Ok(false)` to leave the record untouched.
    fn update_prediction<F>(&self, prediction_id: u64, mut apply: F) -> LoopResult<()>
    where
        F: FnMut(&mut PredictionRecord) -> LoopResult<bool>,
    {
        let k = key(prediction_id);
        loop {
            let current: IVec = self
                .predictions
                .get(k)?
                .ok_or_else(|| LoopError::not_found("prediction", prediction_id.to_string()))?;
            let mut record: PredictionRecord = decode(&current)?;
            if !apply(&mut record)? {
                return Ok(());
            }
            let updated = encode(&record)?;
            match self
                .predictions
                .compare_and_swap(k, Some(current), Some(updated))?
            {
                Ok(()) => return Ok(()),
                Err(_) => {
                    tracing::debug!(prediction_id, "concurrent update detected, retrying");
                    continue;
                }
            }
        }
    }
}

impl FeedbackStore for SledFeedbackStore {
    fn append_input(&self, input: NewInput) -> LoopResult<u64> {
        let id = self.db.generate_id()?;
        let record = InputRecord {
            id,
            timestamp: input.timestamp,
            text: input.text,
            consent: input.consent,
            anonymized: input.anonymized,
        };
        self.inputs.insert(key(id), encode(&record)?)?;
        tracing::debug!(input_id = id, consent = record.consent, "input appended");
        Ok(id)
    }

    fn append_prediction(&self, prediction: NewPrediction) -> LoopResult<u64> {
        if self.inputs.get(key(prediction.input_id))?.is_none() {
            return Err(LoopError::not_found(
                "input",
                prediction.input_id.to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&prediction.confidence) {
            return Err(LoopError::validation(
                "confidence",
                "confidence must be within [0, 1]",
            ));
        }
        if prediction.latency_ms < 0.0 {
            return Err(LoopError::validation("latency", "latency must be non-negative"));
        }

        let id = self.db.generate_id()?;
        let record = PredictionRecord {
            id,
            input_id: prediction.input_id,
            model_version: prediction.model_version,
            prediction: prediction.prediction,
            confidence: prediction.confidence,
            latency_ms: prediction.latency_ms,
            timestamp: prediction.timestamp,
            feedback_correct: None,
            feedback_timestamp: None,
            used_for_training: false,
            training_split: None,
        };
        self.predictions.insert(key(id), encode(&record)?)?;
        tracing::debug!(
            prediction_id = id,
            model_version = %record.model_version,
            confidence = record.confidence,
            "prediction appended"
        );
        Ok(id)
    }

    fn mark_feedback(
        &self,
        prediction_id: u64,
        correct: bool,
        at: DateTime<Utc>,
    ) -> LoopResult<()> {
        self.update_prediction(prediction_id, |record| {
            if record.feedback_correct.is_some() {
                return Err(LoopError::FeedbackAlreadyRecorded { prediction_id });
            }
            record.feedback_correct = Some(correct);
            record.feedback_timestamp = Some(at);
            Ok(true)
        })?;
        tracing::info!(prediction_id, correct, "feedback recorded");
        Ok(())
    }

    fn query_window(&self, window: WindowSpec) -> LoopResult<Vec<WindowRecord>> {
        let mut out = Vec::new();
        match window {
            WindowSpec::Latest(count) => {
                for item in self.predictions.iter().rev() {
                    if out.len() >= count {
                        break;
                    }
                    let (_, value) = item?;
                    if let Some(joined) = self.join(decode(&value)?)? {
                        out.push(joined);
                    }
                }
                out.reverse();
            }
            WindowSpec::Since(since) => {
                for prediction in self.all_predictions() {
                    let prediction = prediction?;
                    if prediction.timestamp >= since {
                        if let Some(joined) = self.join(prediction)? {
                            out.push(joined);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn mark_used_for_training(&self, ids: &[u64], split: TrainingSplit) -> LoopResult<()> {
        for &id in ids {
            self.update_prediction(id, |record| {
                if record.used_for_training {
                    return Ok(false);
                }
                record.used_for_training = true;
                record.training_split = Some(split);
                Ok(true)
            })?;
        }
        Ok(())
    }

    fn training_corpus(&self) -> LoopResult<Vec<WindowRecord>> {
        let mut out = Vec::new();
        for prediction in self.all_predictions() {
            let prediction = prediction?;
            if prediction.used_for_training {
                if let Some(joined) = self.join(prediction)? {
                    out.push(joined);
                }
            }
        }
        Ok(out)
    }

    fn eligible_for_training(
        &self,
        policy: &EligibilityPolicy,
        cap: usize,
    ) -> LoopResult<Vec<WindowRecord>> {
        let mut out = Vec::new();
        for prediction in self.all_predictions() {
            if out.len() >= cap {
                break;
            }
            let prediction = prediction?;
            if prediction.used_for_training {
                continue;
            }
            if let Some(joined) = self.join(prediction)? {
                if policy.admits(&joined) {
                    out.push(joined);
                }
            }
        }
        Ok(out)
    }

    fn get_prediction(&self, prediction_id: u64) -> LoopResult<Option<PredictionRecord>> {
        match self.predictions.get(key(prediction_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_input(&self, input_id: u64) -> LoopResult<usize> {
        if self.inputs.remove(key(input_id))?.is_none() {
            return Err(LoopError::not_found("input", input_id.to_string()));
        }

        let mut doomed = Vec::new();
        for prediction in self.all_predictions() {
            let prediction = prediction?;
            if prediction.input_id == input_id {
                doomed.push(prediction.id);
            }
        }
        for id in &doomed {
            self.predictions.remove(key(*id))?;
        }
        tracing::info!(input_id, cascaded = doomed.len(), "input deleted");
        Ok(doomed.len())
    }

    fn prediction_counts_by_version(&self) -> LoopResult<Vec<VersionMetrics>> {
        // (count, confidence sum, latency sum, min latency, max latency)
        let mut acc: BTreeMap<String, (usize, f64, f64, f64, f64)> = BTreeMap::new();
        for prediction in self.all_predictions() {
            let p = prediction?;
            let entry = acc
                .entry(p.model_version.clone())
                .or_insert((0, 0.0, 0.0, f64::MAX, f64::MIN));
            entry.0 += 1;
            entry.1 += p.confidence;
            entry.2 += p.latency_ms;
            entry.3 = entry.3.min(p.latency_ms);
            entry.4 = entry.4.max(p.latency_ms);
        }

        Ok(acc
            .into_iter()
            .map(|(model_version, (n, conf, lat, min, max))| VersionMetrics {
                model_version,
                prediction_count: n,
                avg_confidence: conf / n as f64,
                avg_latency_ms: lat / n as f64,
                min_latency_ms: min,
                max_latency_ms: max,
            })
            .collect())
    }

    fn feedback_stats(&self) -> LoopResult<FeedbackStats> {
        let mut stats = FeedbackStats::default();
        for prediction in self.all_predictions() {
            stats.count(&prediction?);
        }
        Ok(stats)
    }

    fn recent_predictions(&self, limit: usize) -> LoopResult<Vec<WindowRecord>> {
        let mut out = Vec::with_capacity(limit.min(1024));
        for item in self.predictions.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let (_, value) = item?;
            if let Some(joined) = self.join(decode(&value)?)? {
                out.push(joined);
            }
        }
        Ok(out)
    }

    fn flush(&self) -> LoopResult<()> {
        let bytes = self.db.flush()?;
        tracing::debug!(bytes, "feedback log flushed");
        Ok(())
    }
}
