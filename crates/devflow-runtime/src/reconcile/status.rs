//! Status vocabulary shared by manifests, steps and jobs.
//!
//! Each status type declares its own terminal set through [Lifecycle]; the
//! gateway reads it from there instead of re-deriving it at each call site.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A status enum with an explicit set of absorbing (terminal) values.
pub trait Lifecycle: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Values that, once stored, are never overwritten.
    const TERMINAL: &'static [Self];

    /// Wire name, identical to the serde representation.
    fn as_str(&self) -> &'static str;

    fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

/// Overall status of a Manifest (one CI build attempt).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Lifecycle for ManifestStatus {
    const TERMINAL: &'static [Self] = &[ManifestStatus::Succeeded, ManifestStatus::Failed];

    fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Pending => "pending",
            ManifestStatus::Running => "running",
            ManifestStatus::Succeeded => "succeeded",
            ManifestStatus::Failed => "failed",
        }
    }
}

/// Status of one pipeline task inside a Manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Lifecycle for StepStatus {
    const TERMINAL: &'static [Self] = &[StepStatus::Succeeded, StepStatus::Failed];

    fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
        }
    }
}

/// Status of a deployment Job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Syncing,
    Running,
    Succeeded,
    SyncFailed,
}

impl Lifecycle for JobStatus {
    const TERMINAL: &'static [Self] = &[JobStatus::Succeeded, JobStatus::SyncFailed];

    fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Syncing => "syncing",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::SyncFailed => "sync_failed",
        }
    }
}

/// Value of the pipeline engine's `Succeeded` condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    Unknown,
    True,
    False,
}

impl ConditionStatus {
    /// Parses the engine's wire value. Anything unrecognized yields `None`,
    /// which callers treat as "ignore this event".
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Unknown" => Some(ConditionStatus::Unknown),
            "True" => Some(ConditionStatus::True),
            "False" => Some(ConditionStatus::False),
            _ => None,
        }
    }

    pub fn progress(self) -> Progress {
        match self {
            ConditionStatus::Unknown => Progress::Running,
            ConditionStatus::True => Progress::Succeeded,
            ConditionStatus::False => Progress::Failed,
        }
    }
}

/// Execution progress derived from a condition; shared by runs and task runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Running,
    Succeeded,
    Failed,
}

impl Progress {
    pub fn is_finished(self) -> bool {
        !matches!(self, Progress::Running)
    }
}

impl From<Progress> for ManifestStatus {
    fn from(progress: Progress) -> Self {
        match progress {
            Progress::Running => ManifestStatus::Running,
            Progress::Succeeded => ManifestStatus::Succeeded,
            Progress::Failed => ManifestStatus::Failed,
        }
    }
}

impl From<Progress> for StepStatus {
    fn from(progress: Progress) -> Self {
        match progress {
            Progress::Running => StepStatus::Running,
            Progress::Succeeded => StepStatus::Succeeded,
            Progress::Failed => StepStatus::Failed,
        }
    }
}

pub const SYNC_STATUS_SYNCED: &str = "Synced";
pub const HEALTH_STATUS_HEALTHY: &str = "Healthy";
const FAILED_OPERATION_PHASES: &[&str] = &["Failed", "Error"];

impl JobStatus {
    /// Folds the GitOps engine's two-axis signal into a job status.
    ///
    /// Ready means synced *and* healthy. A failed sync operation is terminal.
    /// Everything else, including `Degraded` health, stays non-terminal since
    /// the engine keeps reconciling.
    pub fn from_gitops(sync: &str, health: &str, operation_phase: Option<&str>) -> Self {
        if sync == SYNC_STATUS_SYNCED && health == HEALTH_STATUS_HEALTHY {
            return JobStatus::Succeeded;
        }
        match operation_phase {
            Some(phase) if FAILED_OPERATION_PHASES.contains(&phase) => JobStatus::SyncFailed,
            _ => JobStatus::Running,
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(ManifestStatus, StepStatus, JobStatus);
