use std::collections::BTreeMap;

use chrono::Utc;

use super::{
    image_tag, manifest_name, random_suffix, ArtifactPatch, CreateManifestRequest, ReleaseError,
    ReleaseService, ReleaseStage, DEFAULT_BRANCH,
};
use crate::engine::{
    ObjectMeta, Param, PipelineRef, PipelineRun, PipelineRunSpec, WorkspaceBinding,
    WorkspaceRequest,
};
use crate::reconcile::correlation::{pipeline_run_name, trace_annotations, LABEL_MANIFEST_NAME};
use crate::reconcile::ManifestStatus;
use crate::store::{
    Application, ApplicationId, FieldUpdate, Manifest, ManifestId, ManifestStep, Timestamps,
};
use crate::trace::TraceContext;

const WORKSPACE_SOURCE: &str = "source";
const WORKSPACE_DOCKER_CONFIG: &str = "dockerconfig";
const WORKSPACE_SSH: &str = "ssh";

impl ReleaseService {
    /// Starts a CI build for an Application and records it as a Manifest.
    ///
    /// The Manifest is persisted only after the run is submitted and the
    /// pipeline definition has been read, so its steps always cover every
    /// task including `finally` tasks.
    #[tracing::instrument(
        skip_all,
        fields(application_id = %request.application_id, trace_id = %trace.trace_id)
    )]
    pub async fn create_manifest(
        &self,
        request: CreateManifestRequest,
        trace: &TraceContext,
    ) -> Result<Manifest, ReleaseError> {
        let app = self
            .repo
            .application(&request.application_id)
            .await?
            .ok_or_else(|| ReleaseError::ApplicationNotFound(request.application_id.clone()))?;

        let branch = request
            .branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BRANCH)
            .to_string();
        let now = Utc::now();
        let name = manifest_name(&app.name, now, random_suffix());
        let tag = image_tag(&branch, &name);
        let image = format!(
            "{}/{}:{tag}",
            self.settings.image_registry.trim_end_matches('/'),
            app.name
        );

        let claim = self
            .workspaces
            .allocate(&WorkspaceRequest {
                namespace: self.settings.pipeline_namespace.clone(),
                generate_name: format!("{}-source-", app.name),
                storage_class: self.settings.workspace_storage_class.clone(),
                size: self.settings.workspace_size.clone(),
            })
            .await
            .map_err(ReleaseError::at(ReleaseStage::AllocateWorkspace))?;

        let run = self.pipeline_run(&app, &branch, &name, &tag, &claim.name, trace, now);
        let submitted = self
            .pipelines
            .submit_pipeline_run(&run)
            .await
            .map_err(ReleaseError::at(ReleaseStage::SubmitPipelineRun))?;
        let pipeline_id = if submitted.metadata.name.is_empty() {
            run.metadata.name.clone()
        } else {
            submitted.metadata.name.clone()
        };

        match submitted.owner_reference() {
            Some(owner) => self
                .workspaces
                .attach_owner(&claim, &owner)
                .await
                .map_err(ReleaseError::at(ReleaseStage::AttachWorkspace))?,
            None => tracing::warn!(
                pipeline_id = %pipeline_id,
                claim = %claim.name,
                "submitted run has no uid; workspace left unowned"
            ),
        }

        let pipeline = self
            .pipelines
            .get_pipeline(&self.settings.pipeline_namespace, &self.settings.pipeline_name)
            .await
            .map_err(ReleaseError::at(ReleaseStage::FetchPipeline))?;
        let steps: Vec<ManifestStep> = pipeline
            .spec
            .step_names()
            .map(ManifestStep::pending)
            .collect();

        let manifest = Manifest {
            id: ManifestId::generate(),
            application_id: app.id.clone(),
            application_name: app.name.clone(),
            name,
            version: tag,
            branch,
            git_repo: app.repo_url.clone(),
            image,
            pipeline_id,
            steps,
            status: ManifestStatus::Pending,
            deployment: app.deployment.clone(),
            digest: None,
            commit_hash: None,
            timestamps: Timestamps::now(),
        };
        self.repo.insert(&manifest).await?;
        tracing::info!(
            manifest_id = %manifest.id,
            manifest = %manifest.name,
            pipeline_id = %manifest.pipeline_id,
            steps = manifest.steps.len(),
            "manifest created"
        );
        Ok(manifest)
    }

    #[allow(clippy::too_many_arguments)]
    fn pipeline_run(
        &self,
        app: &Application,
        branch: &str,
        manifest_name: &str,
        tag: &str,
        claim_name: &str,
        trace: &TraceContext,
        at: chrono::DateTime<Utc>,
    ) -> PipelineRun {
        let settings = &self.settings;
        let metadata = ObjectMeta {
            name: pipeline_run_name(&settings.pipeline_name, at),
            namespace: settings.pipeline_namespace.clone(),
            labels: BTreeMap::from([(LABEL_MANIFEST_NAME.to_string(), manifest_name.to_string())]),
            annotations: trace_annotations(trace),
            ..ObjectMeta::default()
        };
        let spec = PipelineRunSpec {
            pipeline_ref: Some(PipelineRef {
                name: settings.pipeline_name.clone(),
            }),
            params: vec![
                Param::new("git-url", app.repo_url.as_str()),
                Param::new("git-revision", branch),
                Param::new("image-registry", settings.image_registry.as_str()),
                Param::new("name", app.name.as_str()),
                Param::new("image-tag", tag),
                Param::new("manifest-name", manifest_name),
            ],
            workspaces: vec![
                WorkspaceBinding::claim(WORKSPACE_SOURCE, claim_name),
                WorkspaceBinding::secret(
                    WORKSPACE_DOCKER_CONFIG,
                    settings.docker_config_secret.as_str(),
                ),
                WorkspaceBinding::secret(WORKSPACE_SSH, settings.ssh_secret.as_str()),
            ],
        };
        PipelineRun::new(metadata, spec)
    }

    /// Records the image digest and commit a build reported. Never touches
    /// status.
    #[tracing::instrument(skip_all, fields(manifest_id = %id))]
    pub async fn patch_manifest_artifacts(
        &self,
        id: &ManifestId,
        patch: ArtifactPatch,
    ) -> Result<(), ReleaseError> {
        if self.repo.manifest(id).await?.is_none() {
            return Err(ReleaseError::ManifestNotFound(id.clone()));
        }
        let set: Vec<FieldUpdate> = [("digest", patch.digest), ("commit_hash", patch.commit_hash)]
            .into_iter()
            .filter_map(|(field, value)| {
                let value = value?.trim().to_string();
                (!value.is_empty()).then(|| FieldUpdate::new(field, value))
            })
            .collect();
        if set.is_empty() {
            return Ok(());
        }
        if !self
            .repo
            .set_fields::<Manifest>(id.as_str(), &set)
            .await?
            .applied()
        {
            return Err(ReleaseError::ManifestNotFound(id.clone()));
        }
        tracing::info!(fields = set.len(), "manifest artifacts recorded");
        Ok(())
    }

    /// Points an Application at one of its own Manifests.
    #[tracing::instrument(
        skip_all,
        fields(application_id = %application_id, manifest_id = %manifest_id)
    )]
    pub async fn set_active_manifest(
        &self,
        application_id: &ApplicationId,
        manifest_id: &ManifestId,
    ) -> Result<Application, ReleaseError> {
        let mut app = self
            .repo
            .application(application_id)
            .await?
            .ok_or_else(|| ReleaseError::ApplicationNotFound(application_id.clone()))?;
        let manifest = self
            .repo
            .manifest(manifest_id)
            .await?
            .ok_or_else(|| ReleaseError::ManifestNotFound(manifest_id.clone()))?;
        if manifest.application_id != app.id {
            return Err(ReleaseError::ManifestNotForApplication {
                application_id: application_id.clone(),
                manifest_id: manifest_id.clone(),
            });
        }
        let set = [
            FieldUpdate::new("active_manifest_id", manifest.id.as_str()),
            FieldUpdate::new("active_manifest_name", manifest.name.as_str()),
        ];
        if !self
            .repo
            .set_fields::<Application>(app.id.as_str(), &set)
            .await?
            .applied()
        {
            return Err(ReleaseError::ApplicationNotFound(application_id.clone()));
        }
        app.active_manifest_id = Some(manifest.id);
        app.active_manifest_name = Some(manifest.name);
        tracing::info!("active manifest updated");
        Ok(app)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::engine::{
        EngineError, MockGitOpsEngine, MockPipelineEngine, MockWorkspaceAllocator, Pipeline,
        PipelineSpec, PipelineTask, WorkspaceClaim,
    };
    use crate::release::ReleaseSettings;
    use crate::store::{DocumentStore, InMemoryDocumentStore, Repository};

    fn claim_allocator() -> MockWorkspaceAllocator {
        let mut workspaces = MockWorkspaceAllocator::new();
        workspaces.expect_allocate().returning(|req| {
            Ok(WorkspaceClaim {
                namespace: req.namespace.clone(),
                name: format!("{}abcde", req.generate_name),
            })
        });
        workspaces.expect_attach_owner().returning(|_, _| Ok(()));
        workspaces
    }

    fn service(
        store: Arc<dyn DocumentStore>,
        pipelines: MockPipelineEngine,
        workspaces: MockWorkspaceAllocator,
    ) -> ReleaseService {
        ReleaseService::new(
            store,
            Arc::new(pipelines),
            Arc::new(workspaces),
            Arc::new(MockGitOpsEngine::new()),
            ReleaseSettings::default(),
        )
    }

    async fn seed_app(store: &Arc<dyn DocumentStore>) -> Application {
        let app = Application::new("checkout-api", "git@example.com:acme/checkout-api.git");
        Repository::new(store.clone()).insert(&app).await.unwrap();
        app
    }

    #[tokio::test]
    async fn submits_run_with_wire_params_and_snapshots_steps() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let app = seed_app(&store).await;

        let seen = Arc::new(Mutex::new(None::<PipelineRun>));
        let captured = seen.clone();
        let mut pipelines = MockPipelineEngine::new();
        pipelines.expect_submit_pipeline_run().returning(move |run| {
            *captured.lock().unwrap() = Some(run.clone());
            let mut created = run.clone();
            created.metadata.uid = Some("uid-1".into());
            Ok(created)
        });
        pipelines.expect_get_pipeline().returning(|_, _| {
            Ok(Pipeline {
                spec: PipelineSpec {
                    tasks: vec![
                        PipelineTask { name: "A".into() },
                        PipelineTask { name: "B".into() },
                    ],
                    finally: vec![PipelineTask { name: "C".into() }],
                },
                ..Pipeline::default()
            })
        });

        let svc = service(store, pipelines, claim_allocator());
        let trace = TraceContext::generate();
        let manifest = svc
            .create_manifest(
                CreateManifestRequest {
                    application_id: app.id.clone(),
                    branch: Some("feature-x".into()),
                },
                &trace,
            )
            .await
            .unwrap();

        let names: Vec<_> = manifest.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert!(manifest
            .steps
            .iter()
            .all(|s| s.status == crate::reconcile::StepStatus::Pending));
        assert_eq!(manifest.version, format!("feature-x-{}", manifest.name));

        let run = seen.lock().unwrap().clone().unwrap();
        assert_eq!(run.metadata.name, manifest.pipeline_id);
        assert!(run.metadata.name.starts_with("devflow-ci-run-"));
        assert_eq!(run.param("git-revision"), Some("feature-x"));
        assert_eq!(run.param("image-tag"), Some(manifest.version.as_str()));
        assert_eq!(run.param("manifest-name"), Some(manifest.name.as_str()));
        assert_eq!(
            run.metadata.annotations.get("devflow/trace-id"),
            Some(&trace.trace_id)
        );
        let workspaces: Vec<_> = run.spec.workspaces.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(workspaces, vec!["source", "dockerconfig", "ssh"]);
    }

    #[tokio::test]
    async fn submission_failure_persists_nothing() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let dyn_store: Arc<dyn DocumentStore> = store.clone();
        let app = seed_app(&dyn_store).await;

        let mut pipelines = MockPipelineEngine::new();
        pipelines.expect_submit_pipeline_run().returning(|_| {
            Err(EngineError::Api {
                status: 503,
                message: "apiserver unavailable".into(),
            })
        });
        pipelines.expect_get_pipeline().never();

        let svc = service(dyn_store, pipelines, claim_allocator());
        let err = svc
            .create_manifest(
                CreateManifestRequest {
                    application_id: app.id,
                    branch: None,
                },
                &TraceContext::generate(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReleaseError::Engine {
                stage: ReleaseStage::SubmitPipelineRun,
                ..
            }
        ));
        assert!(err.is_retryable());
        assert_eq!(store.count("manifests"), 0);
    }

    #[tokio::test]
    async fn unknown_application_is_not_found() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let mut workspaces = MockWorkspaceAllocator::new();
        workspaces.expect_allocate().never();
        let svc = service(store, MockPipelineEngine::new(), workspaces);
        let err = svc
            .create_manifest(
                CreateManifestRequest {
                    application_id: ApplicationId::generate(),
                    branch: None,
                },
                &TraceContext::generate(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::ApplicationNotFound(_)));
        assert!(!err.is_retryable());
    }

    fn stored_manifest(app: &Application, pipeline_id: &str) -> Manifest {
        Manifest {
            id: ManifestId::generate(),
            application_id: app.id.clone(),
            application_name: app.name.clone(),
            name: "checkout-api2026030109050742".into(),
            version: "checkout-api2026030109050742".into(),
            branch: DEFAULT_BRANCH.into(),
            git_repo: app.repo_url.clone(),
            image: "registry.example.com/checkout-api:checkout-api2026030109050742".into(),
            pipeline_id: pipeline_id.into(),
            steps: vec![ManifestStep::pending("build")],
            status: ManifestStatus::Running,
            deployment: app.deployment.clone(),
            digest: None,
            commit_hash: None,
            timestamps: Timestamps::now(),
        }
    }

    #[tokio::test]
    async fn artifact_patch_skips_blank_fields_and_keeps_status() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let app = seed_app(&store).await;
        let manifest = stored_manifest(&app, "devflow-ci-run-1");
        let repo = Repository::new(store.clone());
        repo.insert(&manifest).await.unwrap();

        let svc = service(store, MockPipelineEngine::new(), MockWorkspaceAllocator::new());
        svc.patch_manifest_artifacts(
            &manifest.id,
            ArtifactPatch {
                digest: Some("sha256:9f86d081".into()),
                commit_hash: Some("  ".into()),
            },
        )
        .await
        .unwrap();

        let stored = repo.manifest(&manifest.id).await.unwrap().unwrap();
        assert_eq!(stored.digest.as_deref(), Some("sha256:9f86d081"));
        assert_eq!(stored.commit_hash, None);
        assert_eq!(stored.status, ManifestStatus::Running);

        let missing = svc
            .patch_manifest_artifacts(&ManifestId::generate(), ArtifactPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(missing, ReleaseError::ManifestNotFound(_)));
    }

    #[tokio::test]
    async fn active_manifest_must_belong_to_application() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let app = seed_app(&store).await;
        let other = Application::new("ledger", "git@example.com:acme/ledger.git");
        let repo = Repository::new(store.clone());
        repo.insert(&other).await.unwrap();
        let own = stored_manifest(&app, "devflow-ci-run-1");
        let foreign = stored_manifest(&other, "devflow-ci-run-2");
        repo.insert(&own).await.unwrap();
        repo.insert(&foreign).await.unwrap();

        let svc = service(store, MockPipelineEngine::new(), MockWorkspaceAllocator::new());
        let err = svc
            .set_active_manifest(&app.id, &foreign.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::ManifestNotForApplication { .. }));

        let updated = svc.set_active_manifest(&app.id, &own.id).await.unwrap();
        assert_eq!(updated.active_manifest_id.as_ref(), Some(&own.id));
        let stored = repo.application(&app.id).await.unwrap().unwrap();
        assert_eq!(stored.active_manifest_name.as_deref(), Some(own.name.as_str()));
    }
}
