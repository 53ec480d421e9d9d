//! Status reconciliation: folds pipeline and GitOps events into devflow records.

pub mod correlation;
mod error;
pub mod gateway;
pub mod gitops;
pub mod pipeline;
pub mod status;
pub mod watch;

pub use error::ReconcileError;
pub use gateway::{StatusGateway, StepTransition};
pub use gitops::GitOpsReconciler;
pub use pipeline::PipelineReconciler;
pub use status::{ConditionStatus, JobStatus, Lifecycle, ManifestStatus, Progress, StepStatus};
pub use watch::{
    ChannelWatcher, EventStream, ResourceListener, ResourceWatcher, WatchError, WatchEvent,
    WatchLoop, WatchStats,
};

/// Why an event produced no write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Labels or name did not identify a devflow record.
    Uncorrelated,
    /// Identifier was well-formed but no live record matches it.
    UnknownRecord,
    /// The record (or step) is already terminal, or became so concurrently.
    Terminal,
    /// No `Succeeded` condition, an unrecognized condition value, or no
    /// GitOps status yet.
    NoSignal,
}

/// Result of handling one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    Skipped(SkipReason),
}

impl ReconcileOutcome {
    pub fn applied(self) -> bool {
        matches!(self, ReconcileOutcome::Applied)
    }
}
