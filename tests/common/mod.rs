#![allow(dead_code)]

use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sentiment_loop::app_state::AppState;
use sentiment_loop::artifact_store::{ArtifactStore, FsArtifactStore};
use sentiment_loop::audit::AuditLog;
use sentiment_loop::benchmark::BenchmarkSet;
use sentiment_loop::config::{AppConfig, ControlLoopConfig};
use sentiment_loop::errors::{LoopError, LoopResult};
use sentiment_loop::feedback_store::FeedbackStore;
use sentiment_loop::feedback_store_sled::SledFeedbackStore;
use sentiment_loop::model_version::{ArtifactRef, RegistryManifest};
use sentiment_loop::pipeline::{
    CancelFlag, LabeledExample, LinearPipeline, PipelineSpec, SentimentModel, TrainingPipeline,
};
use sentiment_loop::records::{NewInput, NewPrediction, Sentiment};
use sentiment_loop::registry::ModelRegistry;

const NOUNS: &[&str] = &["hotel", "phone", "courier", "cafe", "laptop", "checkout"];

/// Config tuned so an ACCURACY trigger is the only thing that can fire.
pub fn test_config(dir: &Path) -> AppConfig {
    AppConfig {
        data_dir: dir.join("feedback").display().to_string(),
        artifact_dir: dir.join("models").display().to_string(),
        audit_log_path: dir.join("audit.jsonl").display().to_string(),
        control: ControlLoopConfig {
            drift_threshold: 1000.0,
            accuracy_floor: 0.7,
            min_sample_count: 30,
            cooldown_period_secs: 3600,
            promotion_epsilon: 1.0,
            min_f1: 0.5,
            max_training_duration_secs: 30,
            ..ControlLoopConfig::default()
        },
        ..AppConfig::default()
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<SledFeedbackStore>,
    pub audit: Arc<AuditLog>,
    pub _dir: tempfile::TempDir,
}

/// Bootstrap the registry with the real pipeline so stubs never run for `v1`.
pub fn bootstrap_registry(config: &AppConfig) {
    let artifacts = Arc::new(FsArtifactStore::open(&config.artifact_dir).unwrap());
    ModelRegistry::open(artifacts, &LinearPipeline::default(), &BenchmarkSet::builtin()).unwrap();
}

pub fn harness_with(
    tweak: impl FnOnce(&mut AppConfig),
    pipeline: Arc<dyn TrainingPipeline>,
    wrap_artifacts: impl FnOnce(Arc<dyn ArtifactStore>) -> Arc<dyn ArtifactStore>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    bootstrap_registry(&config);

    let store = Arc::new(SledFeedbackStore::open(&config.data_dir).unwrap());
    let artifacts: Arc<dyn ArtifactStore> =
        wrap_artifacts(Arc::new(FsArtifactStore::open(&config.artifact_dir).unwrap()));
    let audit = Arc::new(AuditLog::open(&config.audit_log_path).unwrap());

    let state = AppState::from_parts(config, store.clone(), artifacts, pipeline, audit.clone()).unwrap();
    Harness {
        state: Arc::new(state),
        store,
        audit,
        _dir: dir,
    }
}

pub fn harness() -> Harness {
    harness_with(|_| {}, Arc::new(LinearPipeline::default()), |a| a)
}

/// Log one prediction (always POSITIVE) and optionally its feedback.
pub fn log_prediction(
    store: &dyn FeedbackStore,
    text: &str,
    confidence: f64,
    feedback: Option<bool>,
) -> u64 {
    let now = Utc::now();
    let input_id = store
        .append_input(NewInput {
            timestamp: now,
            text: text.to_string(),
            consent: true,
            anonymized: true,
        })
        .unwrap();
    let id = store
        .append_prediction(NewPrediction {
            input_id,
            model_version: "v1".into(),
            prediction: Sentiment::Positive,
            confidence,
            latency_ms: 4.0,
            timestamp: now,
        })
        .unwrap();
    if let Some(correct) = feedback {
        store.mark_feedback(id, correct, now).unwrap();
    }
    id
}

/// `positives` + `negatives` labeled records, all predicted POSITIVE, so
/// window accuracy is `positives / (positives + negatives)`.
pub fn seed_labeled(store: &dyn FeedbackStore, positives: usize, negatives: usize) -> Vec<u64> {
    let mut ids = Vec::new();
    for i in 0..positives.max(negatives) {
        let noun = NOUNS[i % NOUNS.len()];
        if i < positives {
            let text = format!("wonderful {noun}, truly wonderful and delightful");
            ids.push(log_prediction(store, &text, 0.65, Some(true)));
        }
        if i < negatives {
            let text = format!("horrible {noun}, truly horrible and dreadful");
            ids.push(log_prediction(store, &text, 0.65, Some(false)));
        }
    }
    ids
}

pub fn unused_count(store: &dyn FeedbackStore) -> usize {
    store
        .query_window(sentiment_loop::records::WindowSpec::Latest(usize::MAX))
        .unwrap()
        .iter()
        .filter(|r| !r.prediction.used_for_training)
        .count()
}

/// Always predicts the same label with high confidence.
pub struct ConstantPipeline(pub Sentiment);

impl TrainingPipeline for ConstantPipeline {
    fn name(&self) -> String {
        "constant".into()
    }

    fn fit(&self, _examples: &[LabeledExample], _cancel: &CancelFlag) -> LoopResult<SentimentModel> {
        let spec = PipelineSpec {
            buckets: 8,
            ..PipelineSpec::default()
        };
        Ok(SentimentModel {
            pipeline: self.name(),
            spec,
            bias: if self.0 == Sentiment::Positive { 5.0 } else { -5.0 },
            weights: vec![0.0; spec.buckets],
        })
    }
}

pub struct FailingPipeline;

impl TrainingPipeline for FailingPipeline {
    fn name(&self) -> String {
        "failing".into()
    }

    fn fit(&self, _examples: &[LabeledExample], _cancel: &CancelFlag) -> LoopResult<SentimentModel> {
        Err(LoopError::training("fit", "solver exploded"))
    }
}

/// Sleeps in small steps until cancelled; records when it started fitting
/// and whether it saw the cancel.
#[derive(Default)]
pub struct SlowPipeline {
    pub started: AtomicBool,
    pub observed_cancel: AtomicBool,
}

impl SlowPipeline {
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn saw_cancel(&self) -> bool {
        self.observed_cancel.load(Ordering::SeqCst)
    }
}

impl TrainingPipeline for SlowPipeline {
    fn name(&self) -> String {
        "slow".into()
    }

    fn fit(&self, _examples: &[LabeledExample], cancel: &CancelFlag) -> LoopResult<SentimentModel> {
        self.started.store(true, Ordering::SeqCst);
        for _ in 0..400 {
            if cancel.is_cancelled() {
                self.observed_cancel.store(true, Ordering::SeqCst);
                return Err(LoopError::cancelled("slow pipeline stopped"));
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        Err(LoopError::training("fit", "slow pipeline was never cancelled"))
    }
}

/// Delegates to an inner store but refuses to write new model artifacts.
pub struct ReadOnlyArtifacts(pub Arc<dyn ArtifactStore>);

impl ArtifactStore for ReadOnlyArtifacts {
    fn write_model(&self, version: &str, _model: &SentimentModel) -> LoopResult<ArtifactRef> {
        Err(LoopError::registry_corruption(version, "artifact volume is read-only"))
    }

    fn read_model(&self, version: &str, artifact: &ArtifactRef) -> LoopResult<SentimentModel> {
        self.0.read_model(version, artifact)
    }

    fn read_manifest(&self) -> LoopResult<Option<RegistryManifest>> {
        self.0.read_manifest()
    }

    fn write_manifest(&self, manifest: &RegistryManifest) -> LoopResult<()> {
        self.0.write_manifest(manifest)
    }
}

/// Poll `cond` every 20ms for up to `limit`; returns whether it became true.
pub async fn wait_until(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// A second runtime over the same feedback log, artifacts and audit trail.
pub fn reopen(h: &Harness) -> AppState {
    let config = h.state.config.clone();
    let artifacts = Arc::new(FsArtifactStore::open(&config.artifact_dir).unwrap());
    AppState::from_parts(
        config,
        h.store.clone(),
        artifacts,
        Arc::new(LinearPipeline::default()),
        h.audit.clone(),
    )
    .unwrap()
}
