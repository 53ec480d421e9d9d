//! Release orchestration: the synchronous, user-triggered half of devflow.
//!
//! [ReleaseService::create_manifest] starts a CI build and records it;
//! [ReleaseService::create_job] deploys a finished build through GitOps.
//! Both abort on the first failed external call and return the error; neither
//! retries.

mod error;
mod job;
mod manifest;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::{ReleaseError, ReleaseStage};

use crate::config::DevflowConfig;
use crate::engine::{GitOpsEngine, PipelineEngine, WorkspaceAllocator};
use crate::reconcile::StatusGateway;
use crate::store::{ApplicationId, DocumentStore, ManifestId, Repository};

pub const DEFAULT_BRANCH: &str = "main";

/// Everything the orchestrator needs to know about the cluster it targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseSettings {
    pub pipeline_namespace: String,
    pub pipeline_name: String,
    pub image_registry: String,
    pub workspace_storage_class: Option<String>,
    pub workspace_size: String,
    pub docker_config_secret: String,
    pub ssh_secret: String,
    pub gitops_namespace: String,
    pub gitops_project: String,
    pub gitops_repo: String,
    pub target_revision: String,
    pub destination_server: String,
    pub destination_namespace: String,
    pub env: Option<String>,
}

impl From<&DevflowConfig> for ReleaseSettings {
    fn from(config: &DevflowConfig) -> Self {
        Self {
            pipeline_namespace: config.pipeline.namespace.clone(),
            pipeline_name: config.pipeline.name.clone(),
            image_registry: config.pipeline.image_registry.clone(),
            workspace_storage_class: config.pipeline.workspace_storage_class.clone(),
            workspace_size: config.pipeline.workspace_size.clone(),
            docker_config_secret: config.pipeline.docker_config_secret.clone(),
            ssh_secret: config.pipeline.ssh_secret.clone(),
            gitops_namespace: config.gitops.namespace.clone(),
            gitops_project: config.gitops.project.clone(),
            gitops_repo: config.repo.address.clone(),
            target_revision: config.gitops.target_revision.clone(),
            destination_server: config.gitops.destination_server.clone(),
            destination_namespace: config.gitops.destination_namespace.clone(),
            env: config.gitops.env.clone(),
        }
    }
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self::from(&DevflowConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateManifestRequest {
    pub application_id: ApplicationId,
    /// Source branch; blank or absent means `main`.
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub manifest_id: ManifestId,
    /// `install`, `upgrade` or `rollback`; absent means `upgrade`.
    #[serde(default, rename = "type")]
    pub job_type: Option<String>,
}

/// Build artifacts reported back for a Manifest. Blank fields are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPatch {
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
}

/// `<application><yyyyMMddHHmmss><suffix>`.
pub fn manifest_name(application: &str, at: DateTime<Utc>, suffix: u8) -> String {
    format!("{application}{}{suffix}", at.format("%Y%m%d%H%M%S"))
}

/// Two random digits. The v4 uuid serves only as the randomness source.
fn random_suffix() -> u8 {
    (Uuid::new_v4().as_u128() % 100) as u8
}

/// Builds off the default branch are tagged with the bare manifest name.
pub fn image_tag(branch: &str, manifest_name: &str) -> String {
    if branch == DEFAULT_BRANCH {
        manifest_name.to_string()
    } else {
        format!("{branch}-{manifest_name}")
    }
}

/// `<app>/<manifest>/overlays/<env>` with an overlay, `<app>/<manifest>/base`
/// without.
pub fn gitops_source_path(application: &str, manifest: &str, env: Option<&str>) -> String {
    match env.map(str::trim).filter(|e| !e.is_empty()) {
        Some(env) => format!("{application}/{manifest}/overlays/{env}"),
        None => format!("{application}/{manifest}/base"),
    }
}

/// Orchestrates Manifest and Job creation against the injected engines.
#[derive(Clone)]
pub struct ReleaseService {
    repo: Repository,
    gateway: StatusGateway,
    pipelines: Arc<dyn PipelineEngine>,
    workspaces: Arc<dyn WorkspaceAllocator>,
    gitops: Arc<dyn GitOpsEngine>,
    settings: ReleaseSettings,
}

impl ReleaseService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        pipelines: Arc<dyn PipelineEngine>,
        workspaces: Arc<dyn WorkspaceAllocator>,
        gitops: Arc<dyn GitOpsEngine>,
        settings: ReleaseSettings,
    ) -> Self {
        Self {
            repo: Repository::new(store.clone()),
            gateway: StatusGateway::new(store),
            pipelines,
            workspaces,
            gitops,
            settings,
        }
    }

    pub fn settings(&self) -> &ReleaseSettings {
        &self.settings
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }
}
