//! Progress reporting capability.

use crate::types::ProgressStage;

/// Receives stage/percent/bytes updates from long-running operations.
///
/// The job record implements this; the object-store client and the block
/// driver tick it freely. Updates must be cheap: implementations overwrite
/// the current tuple rather than accumulating history.
pub trait ProgressSink: Send + Sync {
    fn update(&self, stage: ProgressStage, percent: f64, bytes_processed: u64, bytes_total: u64);
}

/// A sink that discards all updates.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn update(&self, _stage: ProgressStage, _percent: f64, _bytes_processed: u64, _bytes_total: u64) {}
}
