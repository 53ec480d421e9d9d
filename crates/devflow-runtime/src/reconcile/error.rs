use crate::store::StoreError;

/// Errors an event handler surfaces to its watch loop.
///
/// Correlation misses and stale events are not errors; they come back as
/// [ReconcileOutcome::Skipped](super::ReconcileOutcome::Skipped).
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
