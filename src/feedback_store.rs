use crate::errors::LoopResult;
use crate::records::{
    EligibilityPolicy, FeedbackStats, NewInput, NewPrediction, PredictionRecord, TrainingSplit, VersionMetrics,
    WindowRecord, WindowSpec,
};
use chrono::{DateTime, Utc};

/// Append-only feedback log consumed by the control loop and the prediction surface.
///
/// Implementations must keep writes independent per record: `mark_feedback`
/// on one prediction never blocks or reorders writes on another.
pub trait FeedbackStore: Send + Sync {
    fn append_input(&self, input: NewInput) -> LoopResult<u64>;

    fn append_prediction(&self, prediction: NewPrediction) -> LoopResult<u64>;

    /// Set feedback once. A second write fails with `FeedbackAlreadyRecorded`.
    fn mark_feedback(&self, prediction_id: u64, correct: bool, at: DateTime<Utc>)
        -> LoopResult<()>;

    /// Ordered oldest first, each prediction joined with its input.
    fn query_window(&self, window: WindowSpec) -> LoopResult<Vec<WindowRecord>>;

    /// Flip `used_for_training` to true. Already-used records keep their original split.
    fn mark_used_for_training(&self, ids: &[u64], split: TrainingSplit) -> LoopResult<()>;

    /// Every record already drawn into training (the cumulative corpus).
    fn training_corpus(&self) -> LoopResult<Vec<WindowRecord>>;

    /// Unused records admitted by `policy`, oldest first, at most `cap`.
    fn eligible_for_training(
        &self,
        policy: &EligibilityPolicy,
        cap: usize,
    ) -> LoopResult<Vec<WindowRecord>>;

    fn get_prediction(&self, prediction_id: u64) -> LoopResult<Option<PredictionRecord>>;

    /// Delete an input and, by cascade, every prediction referencing it.
    fn delete_input(&self, input_id: u64) -> LoopResult<usize>;

    fn prediction_counts_by_version(&self) -> LoopResult<Vec<VersionMetrics>>;

    fn feedback_stats(&self) -> LoopResult<FeedbackStats>;

    /// Newest first, at most `limit`.
    fn recent_predictions(&self, limit: usize) -> LoopResult<Vec<WindowRecord>>;

    /// Make every acknowledged write durable.
    fn flush(&self) -> LoopResult<()> {
        Ok(())
    }
}
