//! Ports to the external controllers devflow drives.
//!
//! The pipeline engine runs builds, the GitOps engine deploys them, and the
//! workspace allocator provides the build volume. Each port is a trait so the
//! release orchestrator can be exercised against in-process fakes; the
//! Kubernetes REST adapter lives in [kube_rest].

pub mod argo;
#[cfg(feature = "kube-rest")]
pub mod kube_rest;
pub mod tekton;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use argo::{
    ApplicationDestination, ApplicationSource, ApplicationSpec, ApplicationStatus, AutomatedSync,
    GitOpsApplication, HealthStatus, OperationState, SyncPolicy, SyncStatus,
};
#[cfg(feature = "kube-rest")]
pub use kube_rest::{KubeRestClient, KubeRestConfig};
pub use tekton::{
    Condition, Param, Pipeline, PipelineRef, PipelineRun, PipelineRunSpec, PipelineSpec,
    PipelineTask, RunStatus, TaskRun, WorkspaceBinding,
};

/// Errors raised by engine adapters.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine transport error: {0}")]
    Transport(String),
    #[error("engine request timed out: {0}")]
    Timeout(String),
    #[error("engine api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("engine payload decode failed: {0}")]
    Decode(String),
}

impl EngineError {
    /// Whether the same call may succeed if the caller tries again later.
    ///
    /// Conflicts, throttling and server-side failures are transient; other
    /// API rejections and decode failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport(_) | EngineError::Timeout(_) => true,
            EngineError::Api { status, .. } => *status == 409 || *status == 429 || *status >= 500,
            EngineError::NotFound { .. } | EngineError::Decode(_) => false,
        }
    }
}

/// Kubernetes-style object metadata, trimmed to what devflow reads or writes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Label value, treating an empty string as absent.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

/// A build volume to provision for one pipeline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceRequest {
    pub namespace: String,
    /// Name prefix; the allocator appends a unique suffix.
    pub generate_name: String,
    pub storage_class: Option<String>,
    /// Kubernetes quantity, e.g. `1Gi`.
    pub size: String,
}

/// A provisioned volume claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceClaim {
    pub namespace: String,
    pub name: String,
}

/// Pipeline engine: runs multi-step builds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PipelineEngine: Send + Sync {
    /// Submits a run and returns the object as accepted by the engine.
    async fn submit_pipeline_run(&self, run: &PipelineRun) -> Result<PipelineRun, EngineError>;

    async fn get_pipeline(&self, namespace: &str, name: &str) -> Result<Pipeline, EngineError>;
}

/// Provisions per-run build volumes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkspaceAllocator: Send + Sync {
    async fn allocate(&self, request: &WorkspaceRequest) -> Result<WorkspaceClaim, EngineError>;

    /// Makes the claim owned by `owner` so it is collected with it.
    async fn attach_owner(
        &self,
        claim: &WorkspaceClaim,
        owner: &OwnerReference,
    ) -> Result<(), EngineError>;
}

/// GitOps sync engine: reconciles declarative applications into a cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitOpsEngine: Send + Sync {
    async fn create_application(
        &self,
        app: &GitOpsApplication,
    ) -> Result<GitOpsApplication, EngineError>;

    /// Replaces spec, labels and annotations of an existing application.
    async fn update_application(
        &self,
        app: &GitOpsApplication,
    ) -> Result<GitOpsApplication, EngineError>;
}
