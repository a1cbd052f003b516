//! End-to-end behaviour of the monitoring / retraining loop
//!
//! Every test runs against a fresh sled feedback log, artifact directory and
//! audit log in a tempdir; `v1` is bootstrapped from the builtin benchmark.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use sentiment_loop::audit::Severity;
use sentiment_loop::drift::{
    ConfidenceHistogram, DriftMethod, DriftStatistic, KlDivergence, PopulationStability,
};
use sentiment_loop::drift_snapshot::SnapshotStatus;
use sentiment_loop::feedback_store::FeedbackStore;
use sentiment_loop::model_version::ModelStatus;
use sentiment_loop::orchestrator::RetrainingRun;
use sentiment_loop::pipeline::LinearPipeline;
use sentiment_loop::records::{Sentiment, TrainingSplit, WindowSpec};
use sentiment_loop::retraining_job::JobOutcome;
use sentiment_loop::trigger::TriggerReason;

fn finished(run: RetrainingRun) -> sentiment_loop::retraining_job::RetrainingJob {
    match run {
        RetrainingRun::Finished(job) => job,
        other => panic!("expected a finished job, got {other:?}"),
    }
}

#[test]
fn monitoring_cycle_reports_window_accuracy() {
    let h = harness();
    // 100 predictions, every one with feedback, 95 correct
    for i in 0..100 {
        let text = format!("a perfectly ordinary review number {i}");
        log_prediction(h.store.as_ref(), &text, 0.8, Some(i >= 5));
    }

    let snapshot = h.state.control.run_monitoring_cycle();
    assert_eq!(snapshot.status, SnapshotStatus::Ok);
    assert_eq!(snapshot.sample_count, 100);
    assert_eq!(snapshot.prediction_count, 100);
    assert!((snapshot.accuracy.unwrap() - 0.95).abs() < 1e-12);
    assert!((snapshot.feedback_ratio - 1.0).abs() < 1e-12);
    assert_eq!(snapshot.reference_version.as_deref(), Some("v1"));

    let latest = h.state.control.monitoring.latest().unwrap().unwrap();
    assert_eq!(latest, snapshot);
}

#[test]
fn identical_windows_give_identical_snapshots() {
    let h = harness();
    seed_labeled(h.store.as_ref(), 25, 15);

    let now = Utc::now();
    let first = h.state.control.monitoring.run_cycle(now);
    let second = h.state.control.monitoring.run_cycle(now);
    assert_eq!(first, second);
}

#[tokio::test]
async fn too_little_feedback_never_trains() {
    let h = harness();
    for i in 0..5 {
        log_prediction(h.store.as_ref(), &format!("fine review {i} here"), 0.9, Some(false));
    }
    for i in 0..40 {
        log_prediction(h.store.as_ref(), &format!("unlabeled review {i} here"), 0.9, None);
    }

    match h.state.control.run_retraining_if_triggered().await {
        RetrainingRun::NotTriggered { snapshot, decision } => {
            assert_eq!(snapshot.status, SnapshotStatus::InsufficientData);
            assert_eq!(snapshot.accuracy, None);
            assert!(!decision.fire);
            assert_eq!(decision.reason, TriggerReason::InsufficientData);
        }
        other => panic!("expected no trigger, got {other:?}"),
    }
    assert_eq!(h.state.registry.versions().unwrap().len(), 1);
    assert!(h.state.control.orchestrator.jobs().unwrap().is_empty());
    assert_eq!(unused_count(h.store.as_ref()), 45);
}

#[tokio::test]
async fn low_accuracy_retrains_and_promotes() {
    let h = harness();
    let ids = seed_labeled(h.store.as_ref(), 30, 30);

    let job = finished(h.state.control.run_retraining_if_triggered().await);
    assert_eq!(job.trigger_reason, TriggerReason::Accuracy);
    assert_eq!(job.outcome, JobOutcome::Success, "{}", job.message);
    assert_eq!(job.model_version.as_deref(), Some("v2"));
    assert_eq!(job.records_consumed, 60);

    let active = h.state.registry.get_active().unwrap();
    assert_eq!(active.version, "v2");
    assert_eq!(active.metadata.status, ModelStatus::Active);
    assert_eq!(active.metadata.training_window.new_records, 60);
    assert_eq!(active.metadata.training_window.train_count, 42);
    assert_eq!(active.metadata.training_window.test_count, 18);
    assert_eq!(h.state.registry.active_count().unwrap(), 1);
    assert_eq!(
        h.state.registry.get("v1").unwrap().unwrap().status,
        ModelStatus::Archived
    );

    // Every consumed record carries its split
    let mut tests = 0;
    for id in ids {
        let record = h.store.get_prediction(id).unwrap().unwrap();
        assert!(record.used_for_training);
        if record.training_split == Some(TrainingSplit::Test) {
            tests += 1;
        }
    }
    assert_eq!(tests, 18);

    // The new model scores what it was trained on
    let scored = active.model.score("wonderful hotel, truly wonderful and delightful");
    assert_eq!(scored.label, Sentiment::Positive);

    // Still low accuracy on the window, but the fire just started a cooldown
    match h.state.control.run_retraining_if_triggered().await {
        RetrainingRun::NotTriggered { decision, .. } => {
            assert_eq!(decision.reason, TriggerReason::Cooldown)
        }
        other => panic!("expected cooldown, got {other:?}"),
    }
    assert_eq!(h.state.control.orchestrator.jobs().unwrap().len(), 1);
    assert!(h.audit.verify_chain().unwrap() >= 3);
}

#[tokio::test]
async fn second_run_trains_on_the_cumulative_corpus() {
    let h = harness_with(
        |c| c.control.cooldown_period_secs = 0,
        Arc::new(LinearPipeline::default()),
        |a| a,
    );
    seed_labeled(h.store.as_ref(), 30, 30);
    let first = finished(h.state.control.run_retraining_if_triggered().await);
    assert_eq!(first.outcome, JobOutcome::Success, "{}", first.message);

    seed_labeled(h.store.as_ref(), 10, 10);
    let second = finished(h.state.control.run_retraining_if_triggered().await);
    assert_eq!(second.records_consumed, 20);

    let v3 = h.state.registry.get("v3").unwrap().unwrap();
    assert_eq!(v3.training_window.prior_corpus, 60);
    assert_eq!(v3.training_window.new_records, 20);
    assert_eq!(
        v3.training_window.train_count + v3.training_window.test_count,
        80
    );
}

#[tokio::test]
async fn retraining_is_reproducible_from_the_same_log() {
    let a = harness();
    let b = harness();
    seed_labeled(a.store.as_ref(), 30, 30);
    seed_labeled(b.store.as_ref(), 30, 30);

    finished(a.state.control.run_retraining_if_triggered().await);
    finished(b.state.control.run_retraining_if_triggered().await);

    let va = a.state.registry.get("v2").unwrap().unwrap();
    let vb = b.state.registry.get("v2").unwrap().unwrap();
    assert_eq!(va.training_window, vb.training_window);
    assert_eq!(va.metrics, vb.metrics);
    assert_eq!(va.artifact.sha256, vb.artifact.sha256);
}

#[tokio::test]
async fn failing_validation_keeps_the_active_model() {
    let h = harness_with(
        |_| {},
        Arc::new(ConstantPipeline(Sentiment::Positive)),
        |a| a,
    );
    seed_labeled(h.store.as_ref(), 20, 40);

    let job = finished(h.state.control.run_retraining_if_triggered().await);
    assert_eq!(job.outcome, JobOutcome::ValidationRejected);
    assert_eq!(job.model_version.as_deref(), Some("v2"));
    assert!(job.message.contains("below floor"), "{}", job.message);

    let v2 = h.state.registry.get("v2").unwrap().unwrap();
    assert_eq!(v2.status, ModelStatus::Rejected);
    assert!(!v2.validation.unwrap().passed);
    assert_eq!(h.state.registry.get_active().unwrap().version, "v1");

    // A rejected job still consumes its batch
    assert_eq!(unused_count(h.store.as_ref()), 0);

    // Rejected is terminal
    assert!(h.state.control.rollback("v2").is_err());

    match h.state.control.run_retraining_if_triggered().await {
        RetrainingRun::NotTriggered { decision, .. } => {
            assert_eq!(decision.reason, TriggerReason::Cooldown)
        }
        other => panic!("expected cooldown, got {other:?}"),
    }

    let events = h.audit.events().unwrap();
    assert!(events
        .iter()
        .any(|e| e.action == "job_rejected" && e.severity == Severity::Warn));
}

#[tokio::test]
async fn training_failure_leaves_records_eligible() {
    let h = harness_with(|_| {}, Arc::new(FailingPipeline), |a| a);
    seed_labeled(h.store.as_ref(), 30, 30);

    let job = finished(h.state.control.run_retraining_if_triggered().await);
    assert_eq!(job.outcome, JobOutcome::Failed);
    assert_eq!(job.model_version, None);
    assert!(job.message.contains("solver exploded"));

    assert_eq!(unused_count(h.store.as_ref()), 60);
    assert_eq!(h.state.registry.versions().unwrap().len(), 1);
    assert_eq!(h.state.registry.get_active().unwrap().version, "v1");

    let events = h.audit.events().unwrap();
    assert!(events
        .iter()
        .any(|e| e.action == "job_failed" && e.severity == Severity::Critical));
}

#[tokio::test]
async fn registry_write_failure_fails_the_job() {
    let h = harness_with(
        |_| {},
        Arc::new(LinearPipeline::default()),
        |inner| Arc::new(ReadOnlyArtifacts(inner)),
    );
    seed_labeled(h.store.as_ref(), 30, 30);

    let job = finished(h.state.control.run_retraining_if_triggered().await);
    assert_eq!(job.outcome, JobOutcome::Failed);
    assert!(job.message.contains("read-only"), "{}", job.message);

    assert_eq!(unused_count(h.store.as_ref()), 60);
    assert_eq!(h.state.registry.active_count().unwrap(), 1);
    assert_eq!(h.state.registry.get_active().unwrap().version, "v1");
}

#[tokio::test]
async fn training_past_the_deadline_is_cancelled() {
    let slow = Arc::new(SlowPipeline::default());
    let h = harness_with(
        |c| c.control.max_training_duration_secs = 1,
        slow.clone(),
        |a| a,
    );
    seed_labeled(h.store.as_ref(), 30, 30);

    let orchestrator = h.state.control.orchestrator.clone();
    let (first, second) = tokio::join!(
        orchestrator.run_retraining_if_triggered(),
        async {
            // Give the first call time to take the in-flight flag
            tokio::time::sleep(Duration::from_millis(100)).await;
            orchestrator.run_retraining_if_triggered().await
        }
    );

    assert!(matches!(second, RetrainingRun::AlreadyRunning));
    let job = finished(first);
    assert_eq!(job.outcome, JobOutcome::Failed);
    assert!(job.message.contains("max training duration"), "{}", job.message);
    // The job only ends once the worker has stopped
    assert!(slow.saw_cancel());
    assert!(!orchestrator.is_running());

    assert_eq!(unused_count(h.store.as_ref()), 60);
    assert_eq!(h.state.registry.versions().unwrap().len(), 1);
}

#[tokio::test]
async fn dropped_caller_does_not_orphan_the_job() {
    let slow = Arc::new(SlowPipeline::default());
    let h = harness_with(
        |c| c.control.max_training_duration_secs = 1,
        slow.clone(),
        |a| a,
    );
    seed_labeled(h.store.as_ref(), 30, 30);
    let orchestrator = h.state.control.orchestrator.clone();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(300),
        orchestrator.run_retraining_if_triggered(),
    )
    .await;
    assert!(abandoned.is_err());

    // The job keeps the in-flight flag after its caller went away
    assert!(orchestrator.is_running());
    assert!(matches!(
        orchestrator.run_retraining_if_triggered().await,
        RetrainingRun::AlreadyRunning
    ));

    assert!(wait_until(Duration::from_secs(5), || !orchestrator.is_running()).await);
    let jobs = orchestrator.jobs().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].outcome, JobOutcome::Failed);
    assert!(slow.saw_cancel());

    let events = h.audit.events().unwrap();
    assert_eq!(events.iter().filter(|e| e.action == "fired").count(), 1);
    assert!(events
        .iter()
        .any(|e| e.action == "job_failed" && e.subject.as_deref() == Some(jobs[0].id.as_str())));
    assert_eq!(unused_count(h.store.as_ref()), 60);
}

#[tokio::test]
async fn shutdown_cancels_a_job_the_loop_started() {
    let slow = Arc::new(SlowPipeline::default());
    let h = harness_with(|_| {}, slow.clone(), |a| a);
    seed_labeled(h.store.as_ref(), 30, 30);

    let (tx, rx) = tokio::sync::watch::channel(false);
    let looping = tokio::spawn(h.state.control.clone().run(rx));

    assert!(wait_until(Duration::from_secs(5), || slow.started()).await);
    tx.send(true).unwrap();

    // max_training_duration is 30s; shutdown must not wait for it
    tokio::time::timeout(Duration::from_secs(5), looping)
        .await
        .expect("control loop did not stop")
        .unwrap();

    assert!(slow.saw_cancel());
    assert!(!h.state.control.orchestrator.is_running());
    let jobs = h.state.control.jobs().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].outcome, JobOutcome::Failed);
    assert!(jobs[0].message.contains("cancelled"), "{}", jobs[0].message);
    assert_eq!(unused_count(h.store.as_ref()), 60);
    assert_eq!(h.state.registry.get_active().unwrap().version, "v1");
}

#[tokio::test]
async fn idle_loop_stops_on_shutdown() {
    let h = harness();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let looping = tokio::spawn(h.state.control.clone().run(rx));

    // Nothing logged yet: the first cycle has too little data and the loop sleeps
    assert!(wait_until(Duration::from_secs(5), || {
        h.state.control.latest_snapshot().unwrap().is_some()
    })
    .await);
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), looping)
        .await
        .expect("control loop did not stop")
        .unwrap();
    assert!(h.state.control.jobs().unwrap().is_empty());
}

#[test]
fn kl_statistic_selected_through_config() {
    let h = harness_with(
        |c| c.control.drift_method = DriftMethod::Kl,
        Arc::new(LinearPipeline::default()),
        |a| a,
    );
    seed_labeled(h.store.as_ref(), 30, 30);

    let snapshot = h.state.control.run_monitoring_cycle();
    assert_eq!(snapshot.status, SnapshotStatus::Ok);
    assert_eq!(snapshot.drift_statistic, "kl");

    // Every seeded prediction carries confidence 0.65
    let reference = h
        .state
        .control
        .get_active_model()
        .unwrap()
        .metadata
        .reference_histogram
        .clone();
    let window = ConfidenceHistogram::from_confidences(std::iter::repeat(0.65).take(60));
    assert_eq!(snapshot.drift_score, KlDivergence.compute_drift(&reference, &window));
    assert_ne!(
        snapshot.drift_score,
        PopulationStability.compute_drift(&reference, &window)
    );
}

#[test]
fn drift_fires_once_then_cools_down() {
    let h = harness();
    let mut snapshot = h.state.control.run_monitoring_cycle();
    snapshot.status = SnapshotStatus::Ok;
    snapshot.sample_count = 50;
    snapshot.accuracy = Some(0.9);
    snapshot.drift_score = 1500.0;

    let first = h.state.control.evaluate_trigger(&snapshot).unwrap();
    assert!(first.fire);
    assert_eq!(first.reason, TriggerReason::Drift);

    let second = h.state.control.evaluate_trigger(&snapshot).unwrap();
    assert!(!second.fire);
    assert_eq!(second.reason, TriggerReason::Cooldown);

    let fires: Vec<_> = h
        .audit
        .events()
        .unwrap()
        .into_iter()
        .filter(|e| e.actor == "trigger" && e.action == "fired")
        .collect();
    assert_eq!(fires.len(), 1);
    assert_eq!(fires[0].subject.as_deref(), Some("DRIFT"));

    // The cooldown outlives the process
    let reopened = reopen(&h);
    let after_restart = reopened.control.evaluate_trigger(&snapshot).unwrap();
    assert_eq!(after_restart.reason, TriggerReason::Cooldown);
}

#[tokio::test]
async fn last_fire_survives_restart() {
    let h = harness();
    seed_labeled(h.store.as_ref(), 30, 30);
    finished(h.state.control.run_retraining_if_triggered().await);
    let fired_at = h.state.control.trigger.last_fire().unwrap().unwrap();

    let reopened = reopen(&h);

    assert_eq!(reopened.registry.get_active().unwrap().version, "v2");
    let restored = reopened.control.trigger.last_fire().unwrap().unwrap();
    assert!((restored - fired_at).num_seconds().abs() <= 1);
}

#[tokio::test]
async fn rollback_reactivates_an_archived_version() {
    let h = harness_with(
        |c| c.control.cooldown_period_secs = 0,
        Arc::new(LinearPipeline::default()),
        |a| a,
    );
    // v2..v5, each promoted over the last
    for _ in 0..4 {
        seed_labeled(h.store.as_ref(), 20, 20);
        let job = finished(h.state.control.run_retraining_if_triggered().await);
        assert_eq!(job.outcome, JobOutcome::Success, "{}", job.message);
    }
    assert_eq!(h.state.registry.get_active().unwrap().version, "v5");
    let jobs_before = h.state.control.orchestrator.jobs().unwrap().len();

    let active = h.state.control.rollback("v3").unwrap();
    assert_eq!(active.version, "v3");
    assert_eq!(h.state.registry.get_active().unwrap().version, "v3");

    let status = |v: &str| h.state.registry.get(v).unwrap().unwrap().status;
    assert_eq!(status("v3"), ModelStatus::Active);
    assert_eq!(status("v5"), ModelStatus::Archived);
    assert_eq!(status("v4"), ModelStatus::Archived);
    assert_eq!(h.state.registry.active_count().unwrap(), 1);

    // Rollback is not a retraining job
    assert_eq!(h.state.control.orchestrator.jobs().unwrap().len(), jobs_before);
    // The active version is not a rollback target
    assert!(h.state.control.rollback("v3").is_err());
}

#[test]
fn used_flag_never_resets() {
    let h = harness();
    let ids = seed_labeled(h.store.as_ref(), 3, 3);
    h.store
        .mark_used_for_training(&ids, TrainingSplit::Train)
        .unwrap();
    h.store
        .mark_used_for_training(&ids, TrainingSplit::Test)
        .unwrap();

    let window = h.store.query_window(WindowSpec::Latest(10)).unwrap();
    assert!(window.iter().all(|r| r.prediction.used_for_training));
    assert!(window
        .iter()
        .all(|r| r.prediction.training_split == Some(TrainingSplit::Train)));
}
