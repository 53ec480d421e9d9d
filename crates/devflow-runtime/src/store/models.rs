//! Persisted devflow records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reconcile::status::{JobStatus, ManifestStatus, StepStatus};

/// Returned when an id string is not a valid record id.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("malformed record id: {0:?}")]
pub struct MalformedId(pub String);

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = MalformedId;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(value)
                    .map(|id| Self(id.simple().to_string()))
                    .map_err(|_| MalformedId(value.to_string()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

record_id!(
    /// Identity of an [Application].
    ApplicationId
);
record_id!(
    /// Identity of a [Manifest].
    ManifestId
);
record_id!(
    /// Identity of a [Job]. Carried on GitOps applications as a label.
    JobId
);

/// Creation/update/soft-delete timestamps every document carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Timestamps {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

impl Default for Timestamps {
    fn default() -> Self {
        Self::now()
    }
}

/// Persisted record with a fixed collection and a string primary key.
pub trait Document: Serialize + serde::de::DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn key(&self) -> &str;

    fn timestamps(&self) -> &Timestamps;

    fn is_deleted(&self) -> bool {
        self.timestamps().deleted_at.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub target_port: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

/// Deployment-facing metadata of an Application; copied onto each Manifest
/// at creation time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    #[serde(default = "default_replica")]
    pub replica: u32,
    #[serde(default)]
    pub service: ServiceSpec,
    /// Container/runtime flavour, e.g. `deployment` or `rollout`.
    #[serde(default)]
    pub runtime_type: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub config_ids: Vec<String>,
    #[serde(default)]
    pub internet: bool,
}

fn default_replica() -> u32 {
    1
}

impl Default for DeploymentSpec {
    fn default() -> Self {
        Self {
            replica: default_replica(),
            service: ServiceSpec::default(),
            runtime_type: String::new(),
            envs: BTreeMap::new(),
            config_ids: Vec::new(),
            internet: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Application {
    #[serde(rename = "_id")]
    pub id: ApplicationId,
    pub name: String,
    pub repo_url: String,
    #[serde(default)]
    pub deployment: DeploymentSpec,
    #[serde(default)]
    pub active_manifest_id: Option<ManifestId>,
    #[serde(default)]
    pub active_manifest_name: Option<String>,
    #[serde(flatten)]
    pub timestamps: Timestamps,
}

impl Application {
    pub fn new(name: impl Into<String>, repo_url: impl Into<String>) -> Self {
        Self {
            id: ApplicationId::generate(),
            name: name.into(),
            repo_url: repo_url.into(),
            deployment: DeploymentSpec::default(),
            active_manifest_id: None,
            active_manifest_name: None,
            timestamps: Timestamps::now(),
        }
    }
}

impl Document for Application {
    const COLLECTION: &'static str = "applications";

    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }
}

/// One task of the Manifest's pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestStep {
    pub name: String,
    #[serde(default)]
    pub status: StepStatus,
    /// Task run bound to this step; first write wins.
    #[serde(default)]
    pub task_run: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl ManifestStep {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            task_run: None,
            message: None,
            start_time: None,
            end_time: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "_id")]
    pub id: ManifestId,
    pub application_id: ApplicationId,
    pub application_name: String,
    pub name: String,
    /// Image tag this build publishes.
    pub version: String,
    pub branch: String,
    pub git_repo: String,
    pub image: String,
    /// Name of the pipeline run; the correlation id for run and task-run events.
    pub pipeline_id: String,
    #[serde(default)]
    pub steps: Vec<ManifestStep>,
    #[serde(default)]
    pub status: ManifestStatus,
    #[serde(default)]
    pub deployment: DeploymentSpec,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(flatten)]
    pub timestamps: Timestamps,
}

impl Manifest {
    pub fn step(&self, task_name: &str) -> Option<&ManifestStep> {
        self.steps.iter().find(|s| s.name == task_name)
    }
}

impl Document for Manifest {
    const COLLECTION: &'static str = "manifests";

    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }
}

/// Kind of deployment a Job performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Install,
    #[default]
    Upgrade,
    Rollback,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Install => "install",
            JobType::Upgrade => "upgrade",
            JobType::Rollback => "rollback",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "install" => Ok(JobType::Install),
            "upgrade" => Ok(JobType::Upgrade),
            "rollback" => Ok(JobType::Rollback),
            other => Err(format!("unknown job type: {other:?}")),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "_id")]
    pub id: JobId,
    pub application_id: ApplicationId,
    pub application_name: String,
    pub manifest_id: ManifestId,
    pub manifest_name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(flatten)]
    pub timestamps: Timestamps,
}

impl Document for Job {
    const COLLECTION: &'static str = "job";

    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }
}
