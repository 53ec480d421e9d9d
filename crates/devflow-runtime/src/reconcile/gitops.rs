//! GitOps application event handling.

use std::sync::Arc;

use async_trait::async_trait;

use super::correlation::job_key;
use super::gateway::StatusGateway;
use super::status::{JobStatus, Lifecycle};
use super::watch::ResourceListener;
use super::{ReconcileError, ReconcileOutcome, SkipReason};
use crate::engine::GitOpsApplication;
use crate::store::{DocumentStore, Repository};

#[derive(Clone)]
pub struct GitOpsReconciler {
    repo: Repository,
    gateway: StatusGateway,
}

impl GitOpsReconciler {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            repo: Repository::new(store.clone()),
            gateway: StatusGateway::new(store),
        }
    }

    #[tracing::instrument(skip_all, fields(application = %app.metadata.name))]
    pub async fn on_application(
        &self,
        app: &GitOpsApplication,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let job_id = match job_key(app) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "dropping uncorrelated application event");
                return Ok(ReconcileOutcome::Skipped(SkipReason::Uncorrelated));
            }
        };
        let Some(job) = self.repo.job(&job_id).await? else {
            tracing::warn!(job_id = %job_id, "no job for application");
            return Ok(ReconcileOutcome::Skipped(SkipReason::UnknownRecord));
        };
        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "job already terminal");
            return Ok(ReconcileOutcome::Skipped(SkipReason::Terminal));
        }
        let Some(status) = app.status.as_ref() else {
            tracing::debug!(job_id = %job_id, "application has no status yet");
            return Ok(ReconcileOutcome::Skipped(SkipReason::NoSignal));
        };
        let next = JobStatus::from_gitops(
            &status.sync.status,
            &status.health.status,
            status.operation_state.as_ref().map(|op| op.phase.as_str()),
        );
        let applied = self.gateway.advance_job(&job_id, next).await?.applied();
        tracing::info!(
            job_id = %job_id,
            sync = %status.sync.status,
            health = %status.health.status,
            status = %next,
            applied,
            "job status reconciled"
        );
        Ok(if applied {
            ReconcileOutcome::Applied
        } else {
            ReconcileOutcome::Skipped(SkipReason::Terminal)
        })
    }
}

#[async_trait]
impl ResourceListener<GitOpsApplication> for GitOpsReconciler {
    async fn on_event(
        &self,
        resource: &GitOpsApplication,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.on_application(resource).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ApplicationStatus, HealthStatus, ObjectMeta, OperationState, SyncStatus};
    use crate::reconcile::correlation::LABEL_JOB_ID;
    use crate::store::{ApplicationId, Job, JobId, JobType, ManifestId, Timestamps};

    fn application(job_id: &str, sync: &str, health: &str, phase: Option<&str>) -> GitOpsApplication {
        let mut metadata = ObjectMeta::named("checkout-api", "argo-cd");
        metadata.labels.insert(LABEL_JOB_ID.into(), job_id.into());
        GitOpsApplication {
            metadata,
            status: Some(ApplicationStatus {
                sync: SyncStatus {
                    status: sync.into(),
                },
                health: HealthStatus {
                    status: health.into(),
                },
                operation_state: phase.map(|p| OperationState {
                    phase: p.into(),
                    message: None,
                }),
            }),
            ..GitOpsApplication::default()
        }
    }

    async fn reconciler_with_job(status: JobStatus) -> (GitOpsReconciler, Repository, JobId) {
        let store: Arc<dyn DocumentStore> = Arc::new(crate::store::InMemoryDocumentStore::new());
        let repo = Repository::new(store.clone());
        let job = Job {
            id: JobId::generate(),
            application_id: ApplicationId::generate(),
            application_name: "checkout-api".into(),
            manifest_id: ManifestId::generate(),
            manifest_name: "checkout-api2026".into(),
            job_type: JobType::Upgrade,
            status,
            timestamps: Timestamps::now(),
        };
        repo.insert(&job).await.unwrap();
        (GitOpsReconciler::new(store), repo, job.id)
    }

    #[tokio::test]
    async fn synced_and_healthy_completes_the_job() {
        let (reconciler, repo, id) = reconciler_with_job(JobStatus::Syncing).await;
        let progressing = application(id.as_str(), "OutOfSync", "Progressing", Some("Running"));
        assert!(reconciler.on_application(&progressing).await.unwrap().applied());
        assert_eq!(
            repo.job(&id).await.unwrap().unwrap().status,
            JobStatus::Running
        );

        let ready = application(id.as_str(), "Synced", "Healthy", Some("Succeeded"));
        assert!(reconciler.on_application(&ready).await.unwrap().applied());
        assert_eq!(
            reconciler.on_application(&progressing).await.unwrap(),
            ReconcileOutcome::Skipped(SkipReason::Terminal)
        );
        assert_eq!(
            repo.job(&id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn failed_sync_operation_marks_sync_failed() {
        let (reconciler, repo, id) = reconciler_with_job(JobStatus::Running).await;
        let failed = application(id.as_str(), "OutOfSync", "Missing", Some("Failed"));
        assert!(reconciler.on_application(&failed).await.unwrap().applied());
        assert_eq!(
            repo.job(&id).await.unwrap().unwrap().status,
            JobStatus::SyncFailed
        );
    }

    #[tokio::test]
    async fn malformed_or_unknown_job_ids_are_skipped() {
        let (reconciler, _repo, _id) = reconciler_with_job(JobStatus::Syncing).await;
        assert_eq!(
            reconciler
                .on_application(&application("garbage", "Synced", "Healthy", None))
                .await
                .unwrap(),
            ReconcileOutcome::Skipped(SkipReason::Uncorrelated)
        );
        let stranger = JobId::generate();
        assert_eq!(
            reconciler
                .on_application(&application(stranger.as_str(), "Synced", "Healthy", None))
                .await
                .unwrap(),
            ReconcileOutcome::Skipped(SkipReason::UnknownRecord)
        );
    }

    #[tokio::test]
    async fn application_without_status_is_ignored() {
        let (reconciler, repo, id) = reconciler_with_job(JobStatus::Syncing).await;
        let mut app = application(id.as_str(), "", "", None);
        app.status = None;
        assert_eq!(
            reconciler.on_application(&app).await.unwrap(),
            ReconcileOutcome::Skipped(SkipReason::NoSignal)
        );
        assert_eq!(
            repo.job(&id).await.unwrap().unwrap().status,
            JobStatus::Syncing
        );
    }
}
