// config.rs
// Purpose: runtime configuration for the serving, monitoring and retraining loop

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::drift::DriftMethod;
use crate::errors::{LoopError, LoopResult};

/// Knobs of the monitoring/retraining control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlLoopConfig {
    /// drift_score ceiling before a DRIFT trigger fires
    pub drift_threshold: f64,
    pub drift_method: DriftMethod,
    /// accuracy below which an ACCURACY trigger fires; also the validator's floor
    pub accuracy_floor: f64,
    pub schedule_interval_secs: u64,
    pub cooldown_period_secs: u64,
    pub min_sample_count: usize,
    pub train_test_split_ratio: f64,
    pub promotion_epsilon: f64,
    pub max_training_duration_secs: u64,
    pub training_batch_cap: usize,
    pub min_f1: f64,
    /// Size of the window the monitoring cycle reads
    pub window_size: usize,
    pub monitoring_interval_secs: u64,
    pub max_backoff_secs: u64,
    pub split_seed: u64,
    pub include_unlabeled: bool,
    pub pseudo_label_min_confidence: f64,
    pub benchmark_path: Option<String>,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            drift_threshold: 0.2,
            drift_method: DriftMethod::Psi,
            accuracy_floor: 0.7,
            schedule_interval_secs: 7 * 24 * 3600,
            cooldown_period_secs: 3600,
            min_sample_count: 30,
            train_test_split_ratio: 0.7,
            promotion_epsilon: 0.02,
            max_training_duration_secs: 600,
            training_batch_cap: 5000,
            min_f1: 0.6,
            window_size: 500,
            monitoring_interval_secs: 300,
            max_backoff_secs: 3600,
            split_seed: 42,
            include_unlabeled: false,
            pseudo_label_min_confidence: 0.9,
            benchmark_path: None,
        }
    }
}

/// Ceiling for any configured period: ten years.
pub const MAX_PERIOD_SECS: u64 = 10 * 365 * 24 * 3600;

/// Saturates instead of panicking; `validate` rejects out-of-range values first.
fn period(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

impl ControlLoopConfig {
    pub fn schedule_interval(&self) -> chrono::Duration {
        period(self.schedule_interval_secs)
    }

    pub fn cooldown_period(&self) -> chrono::Duration {
        period(self.cooldown_period_secs)
    }

    pub fn max_training_duration(&self) -> Duration {
        Duration::from_secs(self.max_training_duration_secs)
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs.max(1))
    }

    pub fn validate(&self) -> LoopResult<()> {
        if !(0.0..=1.0).contains(&self.accuracy_floor) {
            return Err(LoopError::config("accuracy_floor must be within [0, 1]"));
        }
        if self.drift_threshold.is_nan() || self.drift_threshold < 0.0 {
            return Err(LoopError::config("drift_threshold must be non-negative"));
        }
        if !(self.train_test_split_ratio > 0.0 && self.train_test_split_ratio < 1.0) {
            return Err(LoopError::config(
                "train_test_split_ratio must be strictly between 0 and 1",
            ));
        }
        if self.promotion_epsilon.is_nan() || self.promotion_epsilon < 0.0 {
            return Err(LoopError::config("promotion_epsilon must be non-negative"));
        }
        if self.training_batch_cap == 0 {
            return Err(LoopError::config("training_batch_cap must be at least 1"));
        }
        if self.max_training_duration_secs == 0 {
            return Err(LoopError::config("max_training_duration_secs must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.min_f1) {
            return Err(LoopError::config("min_f1 must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.pseudo_label_min_confidence) {
            return Err(LoopError::config(
                "pseudo_label_min_confidence must be within [0, 1]",
            ));
        }
        if self.window_size == 0 {
            return Err(LoopError::config("window_size must be at least 1"));
        }
        for (field, secs) in [
            ("schedule_interval_secs", self.schedule_interval_secs),
            ("cooldown_period_secs", self.cooldown_period_secs),
            ("max_training_duration_secs", self.max_training_duration_secs),
            ("monitoring_interval_secs", self.monitoring_interval_secs),
            ("max_backoff_secs", self.max_backoff_secs),
        ] {
            if secs > MAX_PERIOD_SECS {
                return Err(LoopError::config(format!(
                    "{field} must be at most {MAX_PERIOD_SECS} seconds"
                )));
            }
        }
        Ok(())
    }
}

/// Input limits for the prediction surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub min_input_length: usize,
    pub max_input_length: usize,
    pub min_words: usize,
    pub enable_pii_detection: bool,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            min_input_length: 3,
            max_input_length: 5000,
            min_words: 3,
            enable_pii_detection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: String,
    pub artifact_dir: String,
    pub audit_log_path: String,
    pub log_level: String,
    pub json_logs: bool,
    pub server: ServerConfig,
    pub prediction: PredictionConfig,
    pub control: ControlLoopConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: "data/feedback_log".to_string(),
            artifact_dir: "data/models".to_string(),
            audit_log_path: "data/audit_log.jsonl".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            server: ServerConfig::default(),
            prediction: PredictionConfig::default(),
            control: ControlLoopConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> LoopResult<()> {
        if self.data_dir.trim().is_empty() {
            return Err(LoopError::config("data_dir cannot be empty"));
        }
        if self.artifact_dir.trim().is_empty() {
            return Err(LoopError::config("artifact_dir cannot be empty"));
        }
        if self.audit_log_path.trim().is_empty() {
            return Err(LoopError::config("audit_log_path cannot be empty"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(LoopError::config(format!(
                "log_level must be one of {valid_levels:?}"
            )));
        }

        if self.prediction.min_input_length < 1 {
            return Err(LoopError::config("min_input_length must be at least 1"));
        }
        if self.prediction.max_input_length < self.prediction.min_input_length {
            return Err(LoopError::config(
                "max_input_length must be greater than min_input_length",
            ));
        }

        self.control.validate()
    }
}
