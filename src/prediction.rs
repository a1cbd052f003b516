//! Prediction surface: validate, scrub, score with the active model, log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::config::PredictionConfig;
use crate::errors::{LoopError, LoopResult};
use crate::feedback_store::FeedbackStore;
use crate::input_validator::InputValidator;
use crate::privacy::anonymize_pii;
use crate::records::{NewInput, NewPrediction, Sentiment};
use crate::registry::ModelRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
    /// Absent when the user withheld consent or logging failed
    pub prediction_id: Option<u64>,
    pub label: Sentiment,
    pub confidence: f64,
    pub latency_ms: f64,
    pub model_version: String,
    pub anonymized: bool,
    pub pii_found: bool,
    pub logged: bool,
}

pub struct PredictionService {
    registry: Arc<ModelRegistry>,
    store: Arc<dyn FeedbackStore>,
    validator: InputValidator,
    scrub_pii: bool,
}

impl PredictionService {
    pub fn new(
        registry: Arc<ModelRegistry>,
        store: Arc<dyn FeedbackStore>,
        config: &PredictionConfig,
    ) -> Self {
        Self {
            registry,
            store,
            validator: InputValidator::new(config),
            scrub_pii: config.enable_pii_detection,
        }
    }

    /// Score `text` with the active model. Logging is best-effort: a store
    /// failure never fails the prediction.
    pub fn predict(&self, text: &str, consent: bool) -> LoopResult<PredictionOutcome> {
        let started = Instant::now();
        let text = self.validator.validate_text(text)?;
        if self.validator.contains_control_chars(text) {
            return Err(LoopError::validation("text", "control characters are not allowed"));
        }

        let active = self.registry.get_active()?;
        let scored = active.model.score(text);
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let now = Utc::now();

        let (stored_text, pii_found) = if self.scrub_pii {
            anonymize_pii(text)
        } else {
            (text.to_string(), false)
        };

        let prediction_id = if consent {
            match self.log(stored_text, &active.version, scored.label, scored.confidence, latency_ms, now) {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!("prediction served but not logged: {e}");
                    None
                }
            }
        } else {
            tracing::debug!("user withheld consent, prediction not logged");
            None
        };

        tracing::info!(
            model_version = %active.version,
            label = %scored.label,
            confidence = scored.confidence,
            latency_ms,
            pii_found,
            logged = prediction_id.is_some(),
            "prediction served"
        );

        Ok(PredictionOutcome {
            prediction_id,
            label: scored.label,
            confidence: scored.confidence,
            latency_ms,
            model_version: active.version.clone(),
            anonymized: self.scrub_pii,
            pii_found,
            logged: prediction_id.is_some(),
        })
    }

    fn log(
        &self,
        text: String,
        version: &str,
        label: Sentiment,
        confidence: f64,
        latency_ms: f64,
        at: DateTime<Utc>,
    ) -> LoopResult<u64> {
        let input_id = self.store.append_input(NewInput {
            timestamp: at,
            text,
            consent: true,
            anonymized: self.scrub_pii,
        })?;
        self.store.append_prediction(NewPrediction {
            input_id,
            model_version: version.to_string(),
            prediction: label,
            confidence,
            latency_ms,
            timestamp: at,
        })
    }

    /// Record the user's verdict on a logged prediction.
    pub fn record_feedback(&self, prediction_id: u64, correct: bool) -> LoopResult<()> {
        self.store.mark_feedback(prediction_id, correct, Utc::now())
    }
}
