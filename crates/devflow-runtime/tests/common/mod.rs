//! In-process engines that record every call, for end-to-end flows.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use devflow_runtime::engine::{
    Condition, GitOpsApplication, ObjectMeta, OwnerReference, Pipeline, PipelineRun, PipelineSpec,
    PipelineTask, RunStatus, TaskRun, WorkspaceClaim, WorkspaceRequest,
};
use devflow_runtime::reconcile::correlation::{LABEL_PIPELINE_RUN, LABEL_PIPELINE_TASK};
use devflow_runtime::store::Application;
use devflow_runtime::{
    DocumentStore, EngineError, GitOpsEngine, InMemoryDocumentStore, PipelineEngine,
    ReleaseService, ReleaseSettings, Repository, WorkspaceAllocator,
};

#[derive(Default)]
pub struct Calls {
    pub allocated: Vec<WorkspaceRequest>,
    pub submitted_runs: Vec<PipelineRun>,
    pub owners: Vec<(WorkspaceClaim, OwnerReference)>,
    pub created_apps: Vec<GitOpsApplication>,
    pub updated_apps: Vec<GitOpsApplication>,
}

impl Calls {
    pub fn external_calls(&self) -> usize {
        self.allocated.len()
            + self.submitted_runs.len()
            + self.owners.len()
            + self.created_apps.len()
            + self.updated_apps.len()
    }
}

/// Pipeline, workspace and GitOps engine in one, backed by vectors.
#[derive(Default)]
pub struct RecordingEngines {
    pub calls: Mutex<Calls>,
    pub tasks: Vec<String>,
    pub finally: Vec<String>,
    pub fail_gitops: bool,
}

impl RecordingEngines {
    pub fn with_pipeline(tasks: &[&str], finally: &[&str]) -> Self {
        Self {
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
            finally: finally.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl PipelineEngine for RecordingEngines {
    async fn submit_pipeline_run(&self, run: &PipelineRun) -> Result<PipelineRun, EngineError> {
        let mut accepted = run.clone();
        accepted.metadata.uid = Some(format!("uid-{}", run.metadata.name));
        self.calls.lock().unwrap().submitted_runs.push(run.clone());
        Ok(accepted)
    }

    async fn get_pipeline(&self, namespace: &str, name: &str) -> Result<Pipeline, EngineError> {
        Ok(Pipeline {
            metadata: ObjectMeta::named(name, namespace),
            spec: PipelineSpec {
                tasks: self
                    .tasks
                    .iter()
                    .map(|name| PipelineTask { name: name.clone() })
                    .collect(),
                finally: self
                    .finally
                    .iter()
                    .map(|name| PipelineTask { name: name.clone() })
                    .collect(),
            },
            ..Pipeline::default()
        })
    }
}

#[async_trait]
impl WorkspaceAllocator for RecordingEngines {
    async fn allocate(&self, request: &WorkspaceRequest) -> Result<WorkspaceClaim, EngineError> {
        let mut calls = self.calls.lock().unwrap();
        calls.allocated.push(request.clone());
        Ok(WorkspaceClaim {
            namespace: request.namespace.clone(),
            name: format!("{}{}", request.generate_name, calls.allocated.len()),
        })
    }

    async fn attach_owner(
        &self,
        claim: &WorkspaceClaim,
        owner: &OwnerReference,
    ) -> Result<(), EngineError> {
        self.calls
            .lock()
            .unwrap()
            .owners
            .push((claim.clone(), owner.clone()));
        Ok(())
    }
}

#[async_trait]
impl GitOpsEngine for RecordingEngines {
    async fn create_application(
        &self,
        app: &GitOpsApplication,
    ) -> Result<GitOpsApplication, EngineError> {
        if self.fail_gitops {
            return Err(EngineError::Api {
                status: 503,
                message: "argocd unavailable".into(),
            });
        }
        self.calls.lock().unwrap().created_apps.push(app.clone());
        Ok(app.clone())
    }

    async fn update_application(
        &self,
        app: &GitOpsApplication,
    ) -> Result<GitOpsApplication, EngineError> {
        if self.fail_gitops {
            return Err(EngineError::Api {
                status: 503,
                message: "argocd unavailable".into(),
            });
        }
        self.calls.lock().unwrap().updated_apps.push(app.clone());
        Ok(app.clone())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryDocumentStore>,
    pub engines: Arc<RecordingEngines>,
    pub service: ReleaseService,
}

impl Harness {
    pub fn new(engines: RecordingEngines) -> Self {
        let store = Arc::new(InMemoryDocumentStore::new());
        let engines = Arc::new(engines);
        let dyn_store: Arc<dyn DocumentStore> = store.clone();
        let service = ReleaseService::new(
            dyn_store,
            engines.clone(),
            engines.clone(),
            engines.clone(),
            ReleaseSettings {
                image_registry: "registry.example.com/devflow".into(),
                gitops_repo: "git@example.com:acme/deploy.git".into(),
                ..ReleaseSettings::default()
            },
        );
        Self {
            store,
            engines,
            service,
        }
    }

    pub fn dyn_store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    pub fn repo(&self) -> &Repository {
        self.service.repository()
    }

    pub async fn application(&self, name: &str) -> Application {
        let app = Application::new(name, format!("git@example.com:acme/{name}.git"));
        self.repo().insert(&app).await.unwrap();
        app
    }
}

pub fn condition(status: &str, message: &str) -> RunStatus {
    RunStatus {
        conditions: vec![Condition {
            condition_type: "Succeeded".into(),
            status: status.into(),
            reason: None,
            message: Some(message.into()),
        }],
        start_time: None,
        completion_time: None,
    }
}

pub fn task_run(
    pipeline_id: &str,
    task: &str,
    run_name: &str,
    status: Option<RunStatus>,
) -> TaskRun {
    TaskRun {
        metadata: ObjectMeta {
            name: run_name.into(),
            labels: BTreeMap::from([
                (LABEL_PIPELINE_RUN.to_string(), pipeline_id.to_string()),
                (LABEL_PIPELINE_TASK.to_string(), task.to_string()),
            ]),
            ..ObjectMeta::default()
        },
        status,
        ..TaskRun::default()
    }
}

pub fn finished_task_run(
    pipeline_id: &str,
    task: &str,
    status: &str,
    at: DateTime<Utc>,
) -> TaskRun {
    let mut run_status = condition(status, "All Steps have completed executing");
    run_status.completion_time = Some(at);
    task_run(
        pipeline_id,
        task,
        &format!("{pipeline_id}-{task}"),
        Some(run_status),
    )
}

pub fn pipeline_run(name: &str, status: Option<RunStatus>) -> PipelineRun {
    PipelineRun {
        metadata: ObjectMeta::named(name, "tekton-pipelines"),
        status,
        ..PipelineRun::default()
    }
}
