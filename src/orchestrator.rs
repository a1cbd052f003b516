//! Retraining orchestrator: fetch, split, train, evaluate, validate, promote.
//!
//! At most one job runs at a time. Training runs on the blocking pool under
//! a deadline; on expiry the cancel flag is raised, the worker is awaited
//! and the partial result is discarded. Records are marked as used only once the validation decision
//! has been applied to the registry.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::audit::{AuditEvent, AuditLog, Severity};
use crate::benchmark::BenchmarkSet;
use crate::config::ControlLoopConfig;
use crate::drift::ConfidenceHistogram;
use crate::drift_snapshot::DriftSnapshot;
use crate::errors::{LoopError, LoopResult, SafeLock};
use crate::evaluation::evaluate;
use crate::feedback_store::FeedbackStore;
use crate::model_version::{ScoreCard, TrainingWindow};
use crate::monitoring::MonitoringEngine;
use crate::pipeline::{CancelFlag, LabeledExample, SentimentModel, TrainingPipeline};
use crate::records::{EligibilityPolicy, Sentiment, TrainingSplit, WindowRecord};
use crate::registry::{ActiveModel, CandidateDraft, ModelRegistry};
use crate::retraining_job::{JobBuilder, JobOutcome, RetrainingJob};
use crate::trigger::{RetrainingTrigger, TriggerDecision, TriggerReason};
use crate::validator::{Baseline, ModelValidator, ValidationPolicy};

const JOB_HISTORY: usize = 100;

/// What one call to [`RetrainingOrchestrator::run_retraining_if_triggered`] did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "run", rename_all = "snake_case")]
pub enum RetrainingRun {
    /// The monitoring cycle could not read the store
    CycleSkipped(DriftSnapshot),
    NotTriggered {
        snapshot: DriftSnapshot,
        decision: TriggerDecision,
    },
    /// Another job holds the in-flight flag; the evaluation was ignored
    AlreadyRunning,
    Finished(RetrainingJob),
    /// The job task panicked before reporting
    Aborted { error: String },
}

impl RetrainingRun {
    pub fn job(&self) -> Option<&RetrainingJob> {
        match self {
            RetrainingRun::Finished(job) => Some(job),
            _ => None,
        }
    }
}

/// Label used for training: the feedback label, else the model's own prediction.
pub fn training_label(record: &WindowRecord) -> Sentiment {
    record
        .prediction
        .feedback_label()
        .unwrap_or(record.prediction.prediction)
}

/// Deterministic split of new prediction ids into (train, test).
///
/// Ids are sorted, shuffled with a seeded RNG and cut at `floor(n * ratio)`.
pub fn split_batch(ids: &[u64], ratio: f64, seed: u64) -> (Vec<u64>, Vec<u64>) {
    let mut ordered = ids.to_vec();
    ordered.sort_unstable();
    ordered.shuffle(&mut StdRng::seed_from_u64(seed));
    let cut = ((ordered.len() as f64) * ratio).floor() as usize;
    let test = ordered.split_off(cut.min(ordered.len()));
    (ordered, test)
}

/// Records drawn for one run, already split.
#[derive(Debug, Clone)]
struct TrainingPlan {
    train: Vec<LabeledExample>,
    test: Vec<LabeledExample>,
    new_train_ids: Vec<u64>,
    new_test_ids: Vec<u64>,
    window: TrainingWindow,
}

impl TrainingPlan {
    fn consumed(&self) -> usize {
        self.new_train_ids.len() + self.new_test_ids.len()
    }
}

fn build_plan(store: &dyn FeedbackStore, cfg: &ControlLoopConfig) -> LoopResult<TrainingPlan> {
    let corpus = store.training_corpus()?;
    let policy = EligibilityPolicy {
        include_unlabeled: cfg.include_unlabeled,
        pseudo_label_min_confidence: cfg.pseudo_label_min_confidence,
    };
    let batch = store.eligible_for_training(&policy, cfg.training_batch_cap)?;

    let batch_ids: Vec<u64> = batch.iter().map(|r| r.prediction.id).collect();
    let (new_train_ids, new_test_ids) =
        split_batch(&batch_ids, cfg.train_test_split_ratio, cfg.split_seed);

    let mut train = Vec::new();
    let mut test = Vec::new();
    for record in &corpus {
        let example = LabeledExample::new(record.input.text.clone(), training_label(record));
        match record.prediction.training_split {
            Some(TrainingSplit::Test) => test.push(example),
            _ => train.push(example),
        }
    }
    let test_ids: HashSet<u64> = new_test_ids.iter().copied().collect();
    // Iterate in id order so the example order is reproducible too
    let mut sorted_batch: Vec<&WindowRecord> = batch.iter().collect();
    sorted_batch.sort_by_key(|r| r.prediction.id);
    for record in sorted_batch {
        let example = LabeledExample::new(record.input.text.clone(), training_label(record));
        if test_ids.contains(&record.prediction.id) {
            test.push(example);
        } else {
            train.push(example);
        }
    }

    if train.is_empty() || test.is_empty() {
        return Err(LoopError::InsufficientData {
            sample_count: train.len() + test.len(),
            required: 2,
        });
    }

    let window = TrainingWindow {
        prior_corpus: corpus.len(),
        new_records: batch.len(),
        train_count: train.len(),
        test_count: test.len(),
        split_seed: cfg.split_seed,
        split_ratio: cfg.train_test_split_ratio,
        first_prediction_id: batch_ids.iter().min().copied(),
        last_prediction_id: batch_ids.iter().max().copied(),
    };

    Ok(TrainingPlan {
        train,
        test,
        new_train_ids,
        new_test_ids,
        window,
    })
}

/// A fitted candidate and the active model's scores on the same sets.
struct TrainedCandidate {
    plan: TrainingPlan,
    model: SentimentModel,
    scores: ScoreCard,
    histogram: ConfidenceHistogram,
    baseline: Baseline,
}

fn train_candidate(
    plan: TrainingPlan,
    pipeline: &dyn TrainingPipeline,
    benchmark: &BenchmarkSet,
    active: &ActiveModel,
    cancel: &CancelFlag,
) -> LoopResult<TrainedCandidate> {
    let model = pipeline.fit(&plan.train, cancel)?;
    cancel.check("evaluation")?;

    let test_eval = evaluate(&model, &plan.test);
    let bench_eval = evaluate(&model, &benchmark.examples);
    let baseline = Baseline {
        version: active.version.clone(),
        scores: ScoreCard {
            test: evaluate(&active.model, &plan.test).metrics,
            benchmark: evaluate(&active.model, &benchmark.examples).metrics,
        },
    };

    Ok(TrainedCandidate {
        plan,
        model,
        scores: ScoreCard {
            test: test_eval.metrics,
            benchmark: bench_eval.metrics,
        },
        histogram: test_eval.histogram,
        baseline,
    })
}

/// Clears the in-flight flag when the job task ends, including by panic.
struct InFlightGuard(Arc<RetrainingOrchestrator>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.0.current_cancel.safe_lock() {
            *slot = None;
        }
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

pub struct RetrainingOrchestrator {
    store: Arc<dyn FeedbackStore>,
    monitoring: Arc<MonitoringEngine>,
    trigger: Arc<RetrainingTrigger>,
    validator: ModelValidator,
    registry: Arc<ModelRegistry>,
    pipeline: Arc<dyn TrainingPipeline>,
    benchmark: Arc<BenchmarkSet>,
    config: ControlLoopConfig,
    audit: Arc<AuditLog>,
    in_flight: AtomicBool,
    stopping: AtomicBool,
    current_cancel: Mutex<Option<CancelFlag>>,
    jobs: Mutex<VecDeque<RetrainingJob>>,
}

impl RetrainingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn FeedbackStore>,
        monitoring: Arc<MonitoringEngine>,
        trigger: Arc<RetrainingTrigger>,
        registry: Arc<ModelRegistry>,
        pipeline: Arc<dyn TrainingPipeline>,
        benchmark: Arc<BenchmarkSet>,
        config: ControlLoopConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            monitoring,
            trigger,
            validator: ModelValidator::new(ValidationPolicy::from(&config)),
            registry,
            pipeline,
            benchmark,
            config,
            audit,
            in_flight: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            current_cancel: Mutex::new(None),
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Recent jobs, newest first.
    pub fn jobs(&self) -> LoopResult<Vec<RetrainingJob>> {
        Ok(self.jobs.safe_lock()?.iter().cloned().collect())
    }

    /// Ask the running job, if any, to stop at its next checkpoint.
    pub fn cancel_current(&self) -> LoopResult<bool> {
        match self.current_cancel.safe_lock()?.as_ref() {
            Some(flag) => {
                flag.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel the running job and every job started from now on.
    pub fn shutdown(&self) -> LoopResult<bool> {
        self.stopping.store(true, Ordering::SeqCst);
        self.cancel_current()
    }

    /// Evaluate the trigger against `snapshot`; a fire starts the cooldown
    /// and is written to the audit trail so it survives a restart.
    pub fn evaluate_trigger(
        &self,
        snapshot: &DriftSnapshot,
        now: DateTime<Utc>,
    ) -> LoopResult<TriggerDecision> {
        let decision = self.trigger.evaluate(snapshot, now)?;
        if decision.fire {
            self.audit.record_or_warn(
                AuditEvent::new("trigger", "fired")
                    .with_subject(decision.reason.to_string())
                    .with_context(decision.detail.clone()),
            );
        }
        Ok(decision)
    }

    /// Monitor, evaluate the trigger and, if it fires, run one job to completion.
    ///
    /// The work runs on its own task: dropping the returned future leaves the
    /// job running, and it still reaches a terminal state.
    pub async fn run_retraining_if_triggered(self: &Arc<Self>) -> RetrainingRun {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("retraining job in flight, trigger evaluation ignored");
            return RetrainingRun::AlreadyRunning;
        }
        let guard = InFlightGuard(self.clone());

        let task = tokio::spawn(async move {
            let run = guard.0.cycle().await;
            drop(guard);
            run
        });
        match task.await {
            Ok(run) => run,
            Err(join) => {
                tracing::error!("retraining task died: {join}");
                self.audit.record_or_warn(
                    AuditEvent::new("orchestrator", "task_died")
                        .with_severity(Severity::Critical)
                        .with_context(join.to_string()),
                );
                RetrainingRun::Aborted {
                    error: join.to_string(),
                }
            }
        }
    }

    async fn cycle(&self) -> RetrainingRun {
        let now = Utc::now();
        let snapshot = self.monitoring.run_cycle(now);
        if snapshot.is_skipped() {
            return RetrainingRun::CycleSkipped(snapshot);
        }

        let decision = match self.evaluate_trigger(&snapshot, now) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!("trigger evaluation failed: {e}");
                return RetrainingRun::CycleSkipped(snapshot);
            }
        };
        if !decision.fire {
            if decision.reason == TriggerReason::InsufficientData {
                tracing::info!(detail = %decision.detail, "not enough feedback to judge the model");
            }
            return RetrainingRun::NotTriggered { snapshot, decision };
        }

        RetrainingRun::Finished(self.execute(&decision).await)
    }

    async fn execute(&self, decision: &TriggerDecision) -> RetrainingJob {
        let job = RetrainingJob::start(decision.reason, Utc::now());
        tracing::info!(job_id = %job.id, reason = %decision.reason, "retraining job started");

        let cancel = CancelFlag::new();
        if let Ok(mut slot) = self.current_cancel.safe_lock() {
            *slot = Some(cancel.clone());
        }
        if self.stopping.load(Ordering::SeqCst) {
            cancel.cancel();
        }

        let finished = self.run_job(job, decision.reason, cancel).await;

        if let Ok(mut slot) = self.current_cancel.safe_lock() {
            *slot = None;
        }
        self.conclude(finished)
    }

    async fn run_job(
        &self,
        job: JobBuilder,
        reason: TriggerReason,
        cancel: CancelFlag,
    ) -> (RetrainingJob, Severity) {
        let active = match self.registry.get_active() {
            Ok(active) => active,
            Err(e) => return (job.failed(None, e.to_string()), Severity::Critical),
        };

        let trained = match self.train(active, cancel).await {
            Ok(trained) => trained,
            Err(e) => {
                let severity = match e {
                    LoopError::Cancelled { .. } | LoopError::InsufficientData { .. } => Severity::Error,
                    _ => Severity::Critical,
                };
                return (job.failed(None, e.to_string()), severity);
            }
        };

        let draft = CandidateDraft {
            version: self.registry.reserve_version(),
            training_window: trained.plan.window.clone(),
            metrics: trained.scores,
            reference_histogram: trained.histogram.clone(),
            pipeline: self.pipeline.name(),
            trigger_reason: Some(reason.to_string()),
        };
        let candidate = match self.registry.register_candidate(draft, &trained.model) {
            Ok(candidate) => candidate,
            Err(e) => return (job.failed(None, e.to_string()), Severity::Critical),
        };
        let version = Some(candidate.version.clone());

        let report = self
            .validator
            .validate(&candidate.metrics, Some(&trained.baseline));
        let summary = report.summary();

        if report.passed {
            if let Err(e) = self.registry.promote(&candidate.version, report) {
                return (job.failed(version, e.to_string()), Severity::Critical);
            }
            self.mark_consumed(&trained.plan);
            let message = format!(
                "{} promoted over {} (test accuracy {:.4})",
                candidate.version, trained.baseline.version, candidate.metrics.test.accuracy
            );
            (
                job.finish(JobOutcome::Success, version, trained.plan.consumed(), message),
                Severity::Info,
            )
        } else {
            if let Err(e) = self.registry.reject(&candidate.version, report) {
                return (job.failed(version, e.to_string()), Severity::Critical);
            }
            self.mark_consumed(&trained.plan);
            (
                job.finish(
                    JobOutcome::ValidationRejected,
                    version,
                    trained.plan.consumed(),
                    summary,
                ),
                Severity::Warn,
            )
        }
    }

    /// Plan and fit on the blocking pool, bounded by the configured deadline.
    async fn train(&self, active: Arc<ActiveModel>, cancel: CancelFlag) -> LoopResult<TrainedCandidate> {
        let store = self.store.clone();
        let pipeline = self.pipeline.clone();
        let benchmark = self.benchmark.clone();
        let config = self.config.clone();
        let worker_cancel = cancel.clone();

        let mut handle = tokio::task::spawn_blocking(move || {
            let plan = build_plan(store.as_ref(), &config)?;
            worker_cancel.check("planning")?;
            train_candidate(plan, pipeline.as_ref(), &benchmark, &active, &worker_cancel)
        });

        let budget = self.config.max_training_duration();
        match tokio::time::timeout(budget, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(LoopError::internal(format!("training worker died: {join}"))),
            Err(_) => {
                cancel.cancel();
                // The job is not over until the worker has let go of the data
                if let Err(join) = handle.await {
                    tracing::error!("training worker died after cancel: {join}");
                }
                Err(LoopError::cancelled(format!(
                    "exceeded max training duration of {}s",
                    budget.as_secs()
                )))
            }
        }
    }

    fn mark_consumed(&self, plan: &TrainingPlan) {
        let marked = self
            .store
            .mark_used_for_training(&plan.new_train_ids, TrainingSplit::Train)
            .and_then(|_| {
                self.store
                    .mark_used_for_training(&plan.new_test_ids, TrainingSplit::Test)
            });
        if let Err(e) = marked {
            self.audit.record_or_warn(
                AuditEvent::new("orchestrator", "mark_used_failed")
                    .with_severity(Severity::Error)
                    .with_context(e.to_string()),
            );
        }
    }

    fn conclude(&self, (job, severity): (RetrainingJob, Severity)) -> RetrainingJob {
        let action = match job.outcome {
            JobOutcome::Success => "job_succeeded",
            JobOutcome::ValidationRejected => "job_rejected",
            JobOutcome::Failed => "job_failed",
        };
        self.audit.record_or_warn(
            AuditEvent::new("orchestrator", action)
                .with_subject(job.id.clone())
                .with_severity(severity)
                .with_context(format!(
                    "reason={} outcome={} version={} records={} {}",
                    job.trigger_reason,
                    job.outcome,
                    job.model_version.as_deref().unwrap_or("-"),
                    job.records_consumed,
                    job.message
                )),
        );

        if let Ok(mut jobs) = self.jobs.safe_lock() {
            jobs.push_front(job.clone());
            jobs.truncate(JOB_HISTORY);
        }
        job
    }
}
