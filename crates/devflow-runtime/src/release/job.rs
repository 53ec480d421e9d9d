use std::collections::BTreeMap;

use super::{gitops_source_path, CreateJobRequest, ReleaseError, ReleaseService};
use crate::engine::{
    ApplicationDestination, ApplicationSource, ApplicationSpec, AutomatedSync, GitOpsApplication,
    ObjectMeta, SyncPolicy,
};
use crate::reconcile::correlation::{trace_annotations, LABEL_JOB_ID};
use crate::reconcile::JobStatus;
use crate::store::{Application, Job, JobId, JobType, Manifest, Timestamps, UpdateOutcome};
use crate::trace::TraceContext;

impl ReleaseService {
    /// Creates a deployment Job for a Manifest and submits it to the GitOps
    /// engine: `install` creates the application, `upgrade` and `rollback`
    /// update it.
    ///
    /// The Job is persisted before any external call. If submission fails it
    /// is moved to sync-failed and [ReleaseError::DeploymentFailed] is returned.
    #[tracing::instrument(
        skip_all,
        fields(manifest_id = %request.manifest_id, trace_id = %trace.trace_id)
    )]
    pub async fn create_job(
        &self,
        request: CreateJobRequest,
        trace: &TraceContext,
    ) -> Result<Job, ReleaseError> {
        let job_type = match request
            .job_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            Some(raw) => raw.parse::<JobType>().map_err(ReleaseError::InvalidInput)?,
            None => JobType::default(),
        };

        let manifest = self
            .repo
            .manifest(&request.manifest_id)
            .await?
            .ok_or_else(|| ReleaseError::ManifestNotFound(request.manifest_id.clone()))?;
        let app = self
            .repo
            .application(&manifest.application_id)
            .await?
            .ok_or_else(|| ReleaseError::ApplicationNotFound(manifest.application_id.clone()))?;

        let mut job = Job {
            id: JobId::generate(),
            application_id: app.id.clone(),
            application_name: app.name.clone(),
            manifest_id: manifest.id.clone(),
            manifest_name: manifest.name.clone(),
            job_type,
            status: JobStatus::Pending,
            timestamps: Timestamps::now(),
        };
        self.repo.insert(&job).await?;
        tracing::info!(job_id = %job.id, job_type = %job.job_type, "job created");

        if self
            .gateway
            .advance_job(&job.id, JobStatus::Syncing)
            .await?
            .applied()
        {
            job.status = JobStatus::Syncing;
        }

        let resource = self.gitops_application(&app, &manifest, &job, trace);
        let submitted = match job.job_type {
            JobType::Install => self.gitops.create_application(&resource).await,
            JobType::Upgrade | JobType::Rollback => self.gitops.update_application(&resource).await,
        };
        if let Err(source) = submitted {
            tracing::error!(job_id = %job.id, error = %source, "gitops submission failed");
            match self.gateway.advance_job(&job.id, JobStatus::SyncFailed).await {
                Ok(UpdateOutcome::Applied) => {}
                Ok(UpdateOutcome::Skipped) => {
                    tracing::warn!(job_id = %job.id, "job already terminal, sync failure not recorded")
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "failed to mark job sync-failed")
                }
            }
            return Err(ReleaseError::DeploymentFailed {
                job_id: job.id,
                source,
            });
        }
        tracing::info!(
            job_id = %job.id,
            application = %resource.metadata.name,
            path = %resource.spec.source.path,
            "gitops application submitted"
        );
        Ok(job)
    }

    fn gitops_application(
        &self,
        app: &Application,
        manifest: &Manifest,
        job: &Job,
        trace: &TraceContext,
    ) -> GitOpsApplication {
        let settings = &self.settings;
        let metadata = ObjectMeta {
            name: app.name.clone(),
            namespace: settings.gitops_namespace.clone(),
            labels: BTreeMap::from([(LABEL_JOB_ID.to_string(), job.id.to_string())]),
            annotations: trace_annotations(trace),
            ..ObjectMeta::default()
        };
        let spec = ApplicationSpec {
            project: settings.gitops_project.clone(),
            source: ApplicationSource {
                repo_url: settings.gitops_repo.clone(),
                path: gitops_source_path(&app.name, &manifest.name, settings.env.as_deref()),
                target_revision: settings.target_revision.clone(),
            },
            destination: ApplicationDestination {
                server: settings.destination_server.clone(),
                namespace: settings.destination_namespace.clone(),
            },
            sync_policy: Some(SyncPolicy {
                automated: Some(AutomatedSync {
                    prune: true,
                    self_heal: true,
                }),
            }),
        };
        GitOpsApplication::new(metadata, spec)
    }
}
