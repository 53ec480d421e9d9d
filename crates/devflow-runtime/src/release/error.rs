use std::fmt;

use crate::engine::EngineError;
use crate::store::{ApplicationId, JobId, ManifestId, StoreError};

/// External call a Manifest creation was making when it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseStage {
    AllocateWorkspace,
    SubmitPipelineRun,
    AttachWorkspace,
    FetchPipeline,
}

impl ReleaseStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStage::AllocateWorkspace => "allocate workspace",
            ReleaseStage::SubmitPipelineRun => "submit pipeline run",
            ReleaseStage::AttachWorkspace => "attach workspace owner",
            ReleaseStage::FetchPipeline => "fetch pipeline definition",
        }
    }
}

impl fmt::Display for ReleaseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("application not found: {0}")]
    ApplicationNotFound(ApplicationId),
    #[error("manifest not found: {0}")]
    ManifestNotFound(ManifestId),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("manifest {manifest_id} does not belong to application {application_id}")]
    ManifestNotForApplication {
        application_id: ApplicationId,
        manifest_id: ManifestId,
    },
    #[error("{stage} failed: {source}")]
    Engine {
        stage: ReleaseStage,
        #[source]
        source: EngineError,
    },
    /// The Job was persisted and marked sync-failed.
    #[error("deployment for job {job_id} failed: {source}")]
    DeploymentFailed {
        job_id: JobId,
        #[source]
        source: EngineError,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ReleaseError {
    /// Whether repeating the request may succeed; only transient engine
    /// failures qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReleaseError::Engine { source, .. } | ReleaseError::DeploymentFailed { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }

    pub(crate) fn at(stage: ReleaseStage) -> impl FnOnce(EngineError) -> Self {
        move |source| ReleaseError::Engine { stage, source }
    }
}
