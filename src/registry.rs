//! Model registry: versioned artifacts with exactly one ACTIVE pointer.
//!
//! Transitions are build-then-swap. The artifact is loaded and verified and
//! the manifest is persisted before the in-memory state is replaced, so the
//! write-locked section is a single move of prepared values.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::artifact_store::ArtifactStore;
use crate::audit::{AuditEvent, AuditLog, Severity};
use crate::benchmark::BenchmarkSet;
use crate::drift::ConfidenceHistogram;
use crate::errors::{LoopError, LoopResult, SafeLock, SafeReadLock, SafeWriteLock};
use crate::evaluation::evaluate;
use crate::model_version::{
    parse_sequence, version_tag, ModelStatus, ModelVersion, RegistryManifest, ScoreCard,
    TrainingWindow, ValidationReport,
};
use crate::monitoring::ReferenceProvider;
use crate::pipeline::{CancelFlag, SentimentModel, TrainingPipeline};

/// The servable pair handed to the prediction surface.
#[derive(Debug)]
pub struct ActiveModel {
    pub version: String,
    pub metadata: ModelVersion,
    pub model: Arc<SentimentModel>,
}

/// Everything about a trained candidate except where its artifact lives.
#[derive(Debug, Clone)]
pub struct CandidateDraft {
    pub version: String,
    pub training_window: TrainingWindow,
    pub metrics: ScoreCard,
    pub reference_histogram: ConfidenceHistogram,
    pub pipeline: String,
    pub trigger_reason: Option<String>,
}

struct RegistryState {
    versions: Vec<ModelVersion>,
    active: Arc<ActiveModel>,
}

pub struct ModelRegistry {
    artifacts: Arc<dyn ArtifactStore>,
    state: RwLock<RegistryState>,
    /// Serialises writers; readers never take it.
    transitions: Mutex<()>,
    next_sequence: AtomicU64,
    audit: Option<Arc<AuditLog>>,
}

impl ModelRegistry {
    /// Restore from the manifest, or bootstrap `v1` from the benchmark set.
    pub fn open(
        artifacts: Arc<dyn ArtifactStore>,
        pipeline: &dyn TrainingPipeline,
        benchmark: &BenchmarkSet,
    ) -> LoopResult<Self> {
        let (versions, active) = match artifacts.read_manifest()? {
            Some(manifest) => restore(artifacts.as_ref(), manifest)?,
            None => bootstrap(artifacts.as_ref(), pipeline, benchmark)?,
        };

        let next = versions.iter().map(ModelVersion::sequence).max().unwrap_or(0) + 1;
        tracing::info!(active = %active.version, versions = versions.len(), "model registry ready");

        Ok(Self {
            artifacts,
            state: RwLock::new(RegistryState { versions, active }),
            transitions: Mutex::new(()),
            next_sequence: AtomicU64::new(next),
            audit: None,
        })
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Consistent (artifact, metadata) pair; a clone of the current pointer.
    pub fn get_active(&self) -> LoopResult<Arc<ActiveModel>> {
        Ok(self.state.safe_read()?.active.clone())
    }

    pub fn get(&self, version: &str) -> LoopResult<Option<ModelVersion>> {
        Ok(self
            .state
            .safe_read()?
            .versions
            .iter()
            .find(|v| v.version == version)
            .cloned())
    }

    /// Every version ever registered, newest first.
    pub fn versions(&self) -> LoopResult<Vec<ModelVersion>> {
        let mut versions = self.state.safe_read()?.versions.clone();
        versions.sort_by_key(|v| std::cmp::Reverse(v.sequence()));
        Ok(versions)
    }

    /// Rollback targets, newest first.
    pub fn archived(&self) -> LoopResult<Vec<ModelVersion>> {
        Ok(self
            .versions()?
            .into_iter()
            .filter(|v| v.status == ModelStatus::Archived)
            .collect())
    }

    pub fn active_count(&self) -> LoopResult<usize> {
        Ok(self
            .state
            .safe_read()?
            .versions
            .iter()
            .filter(|v| v.status == ModelStatus::Active)
            .count())
    }

    /// Hand out the next unused `v<N>` tag.
    pub fn reserve_version(&self) -> String {
        version_tag(self.next_sequence.fetch_add(1, Ordering::SeqCst))
    }

    /// Write the candidate's artifact and record it as CANDIDATE.
    pub fn register_candidate(
        &self,
        draft: CandidateDraft,
        model: &SentimentModel,
    ) -> LoopResult<ModelVersion> {
        let _guard = self.transitions.safe_lock()?;
        let mut versions = self.state.safe_read()?.versions.clone();
        if versions.iter().any(|v| v.version == draft.version) {
            return Err(LoopError::registry_corruption(
                &draft.version,
                "version tag already registered",
            ));
        }

        let artifact = self.artifacts.write_model(&draft.version, model)?;
        let candidate = ModelVersion {
            version: draft.version,
            created_at: Utc::now(),
            status: ModelStatus::Candidate,
            training_window: draft.training_window,
            metrics: draft.metrics,
            reference_histogram: draft.reference_histogram,
            artifact,
            pipeline: draft.pipeline,
            validation: None,
            trigger_reason: draft.trigger_reason,
            activated_at: None,
            archived_at: None,
        };
        versions.push(candidate.clone());
        self.commit(versions, None)?;

        tracing::info!(version = %candidate.version, "candidate registered");
        Ok(candidate)
    }

    /// CANDIDATE -> REJECTED, keeping the report for audit.
    pub fn reject(&self, version: &str, report: ValidationReport) -> LoopResult<ModelVersion> {
        let _guard = self.transitions.safe_lock()?;
        let mut versions = self.state.safe_read()?.versions.clone();
        let idx = index_of(&versions, version)?;
        check_transition(&versions[idx], ModelStatus::Rejected)?;

        versions[idx].status = ModelStatus::Rejected;
        versions[idx].validation = Some(report.clone());
        let rejected = versions[idx].clone();
        self.commit(versions, None)?;

        self.audit(
            AuditEvent::new("registry", "reject")
                .with_subject(version)
                .with_severity(Severity::Warn)
                .with_context(report.summary()),
        );
        Ok(rejected)
    }

    /// CANDIDATE -> ACTIVE; the previous ACTIVE becomes ARCHIVED.
    pub fn promote(&self, version: &str, report: ValidationReport) -> LoopResult<Arc<ActiveModel>> {
        let _guard = self.transitions.safe_lock()?;
        let mut versions = self.state.safe_read()?.versions.clone();
        let idx = index_of(&versions, version)?;
        if versions[idx].status != ModelStatus::Candidate {
            return Err(LoopError::invalid_transition(
                version,
                versions[idx].status,
                ModelStatus::Active,
            ));
        }
        if !report.passed {
            return Err(LoopError::validation_rejected(version, report.summary()));
        }

        versions[idx].validation = Some(report);
        let active = self.swap_active(versions, idx)?;

        self.audit(AuditEvent::new("registry", "promote").with_subject(version));
        Ok(active)
    }

    /// ARCHIVED -> ACTIVE without retraining; the current ACTIVE is archived.
    pub fn rollback(&self, target: &str) -> LoopResult<Arc<ActiveModel>> {
        let _guard = self.transitions.safe_lock()?;
        let versions = self.state.safe_read()?.versions.clone();
        let idx = index_of(&versions, target)?;
        if versions[idx].status != ModelStatus::Archived {
            return Err(LoopError::invalid_transition(
                target,
                versions[idx].status,
                ModelStatus::Active,
            ));
        }

        let previous = self.state.safe_read()?.active.version.clone();
        let active = self.swap_active(versions, idx)?;

        self.audit(
            AuditEvent::new("operator", "rollback")
                .with_subject(target)
                .with_severity(Severity::Warn)
                .with_context(format!("{previous} archived")),
        );
        Ok(active)
    }

    /// A corrupted artifact or manifest leaves the prior ACTIVE in place and alerts.
    fn swap_active(&self, versions: Vec<ModelVersion>, idx: usize) -> LoopResult<Arc<ActiveModel>> {
        let target = versions[idx].version.clone();
        self.build_and_swap(versions, idx).inspect_err(|e| {
            if matches!(e, LoopError::RegistryCorruption { .. }) {
                self.audit(
                    AuditEvent::new("registry", "corruption")
                        .with_subject(target.as_str())
                        .with_severity(Severity::Critical)
                        .with_context(e.to_string()),
                );
            }
        })
    }

    /// Load the artifact, persist the manifest, then swap.
    fn build_and_swap(&self, mut versions: Vec<ModelVersion>, idx: usize) -> LoopResult<Arc<ActiveModel>> {
        let version = versions[idx].version.clone();
        let model = self.artifacts.read_model(&version, &versions[idx].artifact)?;

        let now = Utc::now();
        for v in versions.iter_mut() {
            if v.status == ModelStatus::Active {
                v.status = ModelStatus::Archived;
                v.archived_at = Some(now);
            }
        }
        versions[idx].status = ModelStatus::Active;
        versions[idx].activated_at = Some(now);

        let active = Arc::new(ActiveModel {
            version,
            metadata: versions[idx].clone(),
            model: Arc::new(model),
        });
        self.commit(versions, Some(active.clone()))?;
        tracing::info!(active = %active.version, "active model swapped");
        Ok(active)
    }

    /// Persist, then replace the in-memory state. Caller holds `transitions`.
    fn commit(&self, versions: Vec<ModelVersion>, active: Option<Arc<ActiveModel>>) -> LoopResult<()> {
        let active_tag = match &active {
            Some(a) => a.version.clone(),
            None => self.state.safe_read()?.active.version.clone(),
        };
        let manifest = RegistryManifest {
            active: active_tag,
            versions: versions.clone(),
            updated_at: Utc::now(),
        };
        self.artifacts.write_manifest(&manifest)?;

        let mut state = self.state.safe_write()?;
        state.versions = versions;
        if let Some(active) = active {
            state.active = active;
        }
        Ok(())
    }

    fn audit(&self, event: AuditEvent) {
        match &self.audit {
            Some(log) => log.record_or_warn(event),
            None => event.trace(),
        }
    }
}

impl ReferenceProvider for ModelRegistry {
    fn reference(&self) -> LoopResult<Option<(String, ConfidenceHistogram)>> {
        let active = self.get_active()?;
        if active.metadata.reference_histogram.is_empty() {
            return Ok(None);
        }
        Ok(Some((
            active.version.clone(),
            active.metadata.reference_histogram.clone(),
        )))
    }
}

fn index_of(versions: &[ModelVersion], version: &str) -> LoopResult<usize> {
    versions
        .iter()
        .position(|v| v.version == version)
        .ok_or_else(|| LoopError::not_found("model version", version))
}

fn check_transition(version: &ModelVersion, next: ModelStatus) -> LoopResult<()> {
    if version.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(LoopError::invalid_transition(&version.version, version.status, next))
    }
}

fn restore(
    artifacts: &dyn ArtifactStore,
    manifest: RegistryManifest,
) -> LoopResult<(Vec<ModelVersion>, Arc<ActiveModel>)> {
    let actives: Vec<&ModelVersion> = manifest
        .versions
        .iter()
        .filter(|v| v.status == ModelStatus::Active)
        .collect();
    let metadata = match actives.as_slice() {
        [only] if only.version == manifest.active => (*only).clone(),
        _ => {
            return Err(LoopError::registry_corruption(
                &manifest.active,
                format!("manifest lists {} ACTIVE versions", actives.len()),
            ))
        }
    };
    if manifest.versions.iter().any(|v| parse_sequence(&v.version).is_none()) {
        return Err(LoopError::registry_corruption("manifest", "malformed version tag"));
    }

    let model = artifacts.read_model(&metadata.version, &metadata.artifact)?;
    let active = Arc::new(ActiveModel {
        version: metadata.version.clone(),
        metadata,
        model: Arc::new(model),
    });
    Ok((manifest.versions, active))
}

fn bootstrap(
    artifacts: &dyn ArtifactStore,
    pipeline: &dyn TrainingPipeline,
    benchmark: &BenchmarkSet,
) -> LoopResult<(Vec<ModelVersion>, Arc<ActiveModel>)> {
    let version = version_tag(1);
    tracing::info!(benchmark = %benchmark.name, "no registry manifest, bootstrapping {version}");

    let model = pipeline.fit(&benchmark.examples, &CancelFlag::new())?;
    let eval = evaluate(&model, &benchmark.examples);
    let artifact = artifacts.write_model(&version, &model)?;
    let now = Utc::now();

    let metadata = ModelVersion {
        version: version.clone(),
        created_at: now,
        status: ModelStatus::Active,
        training_window: TrainingWindow {
            train_count: benchmark.len(),
            ..TrainingWindow::default()
        },
        metrics: ScoreCard {
            test: eval.metrics,
            benchmark: eval.metrics,
        },
        reference_histogram: eval.histogram,
        artifact,
        pipeline: pipeline.name(),
        validation: None,
        trigger_reason: None,
        activated_at: Some(now),
        archived_at: None,
    };

    artifacts.write_manifest(&RegistryManifest {
        active: version.clone(),
        versions: vec![metadata.clone()],
        updated_at: now,
    })?;

    let active = Arc::new(ActiveModel {
        version,
        metadata: metadata.clone(),
        model: Arc::new(model),
    });
    Ok((vec![metadata], active))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact_store::FsArtifactStore;
    use crate::pipeline::LinearPipeline;
    use tempfile::tempdir;

    fn passed() -> ValidationReport {
        ValidationReport {
            passed: true,
            compared_to: None,
            reasons: vec![],
            checked_at: Utc::now(),
        }
    }

    fn draft(registry: &ModelRegistry) -> CandidateDraft {
        CandidateDraft {
            version: registry.reserve_version(),
            training_window: TrainingWindow::default(),
            metrics: ScoreCard::default(),
            reference_histogram: ConfidenceHistogram::from_confidences([0.9, 0.8]),
            pipeline: "hashed-logistic/4096".into(),
            trigger_reason: Some("DRIFT".into()),
        }
    }

    fn open(dir: &std::path::Path) -> ModelRegistry {
        let artifacts = Arc::new(FsArtifactStore::open(dir).unwrap());
        ModelRegistry::open(artifacts, &LinearPipeline::default(), &BenchmarkSet::builtin()).unwrap()
    }

    fn model(bias: f64) -> SentimentModel {
        SentimentModel {
            pipeline: "hashed-logistic/4".into(),
            spec: crate::pipeline::PipelineSpec {
                buckets: 4,
                ..Default::default()
            },
            bias,
            weights: vec![0.0; 4],
        }
    }

    #[test]
    fn bootstrap_creates_single_active_v1() {
        let dir = tempdir().unwrap();
        let registry = open(dir.path());
        let active = registry.get_active().unwrap();
        assert_eq!(active.version, "v1");
        assert_eq!(registry.active_count().unwrap(), 1);
        assert_eq!(registry.reserve_version(), "v2");
    }

    #[test]
    fn promote_archives_previous_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let registry = open(dir.path());
        let candidate = registry.register_candidate(draft(&registry), &model(0.3)).unwrap();
        registry.promote(&candidate.version, passed()).unwrap();

        assert_eq!(registry.get_active().unwrap().version, "v2");
        assert_eq!(registry.get("v1").unwrap().unwrap().status, ModelStatus::Archived);
        drop(registry);

        let reopened = open(dir.path());
        assert_eq!(reopened.get_active().unwrap().version, "v2");
        assert_eq!(reopened.active_count().unwrap(), 1);
        assert_eq!(reopened.reserve_version(), "v3");
    }

    #[test]
    fn rejected_version_can_never_be_activated() {
        let dir = tempdir().unwrap();
        let registry = open(dir.path());
        let candidate = registry.register_candidate(draft(&registry), &model(0.3)).unwrap();
        registry.reject(&candidate.version, passed()).unwrap();

        assert!(matches!(
            registry.promote(&candidate.version, passed()),
            Err(LoopError::InvalidTransition { .. })
        ));
        assert!(matches!(
            registry.rollback(&candidate.version),
            Err(LoopError::InvalidTransition { .. })
        ));
        assert_eq!(registry.get_active().unwrap().version, "v1");
    }

    #[test]
    fn failed_report_cannot_promote() {
        let dir = tempdir().unwrap();
        let registry = open(dir.path());
        let candidate = registry.register_candidate(draft(&registry), &model(0.3)).unwrap();
        let mut report = passed();
        report.passed = false;
        report.reasons.push("too weak".into());

        assert!(matches!(
            registry.promote(&candidate.version, report),
            Err(LoopError::ValidationRejected { .. })
        ));
        assert_eq!(registry.get_active().unwrap().version, "v1");
    }

    #[test]
    fn corrupted_candidate_artifact_aborts_promotion() {
        let dir = tempdir().unwrap();
        let registry = open(dir.path());
        let candidate = registry.register_candidate(draft(&registry), &model(0.3)).unwrap();
        std::fs::write(dir.path().join(&candidate.artifact.path), b"garbage").unwrap();

        let err = registry.promote(&candidate.version, passed()).unwrap_err();
        assert!(matches!(err, LoopError::RegistryCorruption { .. }));
        assert_eq!(registry.get_active().unwrap().version, "v1");
        assert_eq!(registry.get("v1").unwrap().unwrap().status, ModelStatus::Active);
        assert_eq!(registry.get(&candidate.version).unwrap().unwrap().status, ModelStatus::Candidate);
    }

    #[test]
    fn corruption_raises_critical_alert() {
        let dir = tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).unwrap());
        let registry = open(&dir.path().join("models")).with_audit(audit.clone());
        let candidate = registry.register_candidate(draft(&registry), &model(0.3)).unwrap();
        registry.promote(&candidate.version, passed()).unwrap();
        // Damage the archived v1 artifact, then try to roll back to it
        let v1 = registry.get("v1").unwrap().unwrap();
        std::fs::write(dir.path().join("models").join(&v1.artifact.path), b"{}").unwrap();

        assert!(registry.rollback("v1").is_err());
        assert_eq!(registry.get_active().unwrap().version, candidate.version);
        let events = audit.events().unwrap();
        assert!(events
            .iter()
            .any(|e| e.action == "corruption" && e.severity == Severity::Critical));
    }

    #[test]
    fn rollback_to_active_is_invalid() {
        let dir = tempdir().unwrap();
        let registry = open(dir.path());
        assert!(matches!(
            registry.rollback("v1"),
            Err(LoopError::InvalidTransition { .. })
        ));
        assert!(matches!(registry.rollback("v9"), Err(LoopError::NotFound { .. })));
    }
}
