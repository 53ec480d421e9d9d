//! Pipeline-run and task-run event handling.
//!
//! The two streams are not ordered with respect to each other. A task run may
//! arrive before its pipeline run, after it, or twice; every write goes through
//! the [StatusGateway] so late or repeated events are no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::correlation::{pipeline_run_key, task_run_key};
use super::gateway::{StatusGateway, StepTransition};
use super::status::{ConditionStatus, Lifecycle, ManifestStatus, Progress, StepStatus};
use super::watch::ResourceListener;
use super::{ReconcileError, ReconcileOutcome, SkipReason};
use crate::engine::{PipelineRun, RunStatus, TaskRun};
use crate::store::{DocumentStore, Repository};

/// Maps the `Succeeded` condition; `None` when there is nothing to act on.
fn run_progress(status: Option<&RunStatus>) -> Option<(Progress, String)> {
    let condition = status?.succeeded_condition()?;
    let progress = ConditionStatus::parse(&condition.status)?.progress();
    Some((progress, condition.message.clone().unwrap_or_default()))
}

fn outcome(applied: bool) -> ReconcileOutcome {
    if applied {
        ReconcileOutcome::Applied
    } else {
        ReconcileOutcome::Skipped(SkipReason::Terminal)
    }
}

#[derive(Clone)]
pub struct PipelineReconciler {
    repo: Repository,
    gateway: StatusGateway,
}

impl PipelineReconciler {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            repo: Repository::new(store.clone()),
            gateway: StatusGateway::new(store),
        }
    }

    #[tracing::instrument(skip_all, fields(task_run = %run.metadata.name))]
    pub async fn on_task_run(&self, run: &TaskRun) -> Result<ReconcileOutcome, ReconcileError> {
        let key = match task_run_key(run) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "dropping uncorrelated task run event");
                return Ok(ReconcileOutcome::Skipped(SkipReason::Uncorrelated));
            }
        };
        let Some(manifest) = self.repo.manifest_by_pipeline(key.pipeline_id).await? else {
            tracing::warn!(pipeline_id = key.pipeline_id, "no manifest for task run");
            return Ok(ReconcileOutcome::Skipped(SkipReason::UnknownRecord));
        };
        let Some(step) = manifest.step(key.task_name) else {
            tracing::warn!(
                manifest_id = %manifest.id,
                task_name = key.task_name,
                "task is not a step of its manifest"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::UnknownRecord));
        };
        if step.status.is_terminal() {
            tracing::debug!(task_name = key.task_name, status = %step.status, "step already terminal");
            return Ok(ReconcileOutcome::Skipped(SkipReason::Terminal));
        }

        let bound = self
            .gateway
            .bind_step_execution(key.pipeline_id, key.task_name, key.task_run)
            .await?;
        // The first binding stays; status from sibling runs still applies and
        // terminal states decide the race.
        if !bound.applied() {
            tracing::warn!(
                manifest_id = %manifest.id,
                task_name = key.task_name,
                bound_to = ?step.task_run,
                "step is bound to another task run"
            );
        }

        let status = run.status.as_ref();
        let Some((progress, message)) = run_progress(status) else {
            tracing::debug!(task_name = key.task_name, "task run has no usable condition");
            return Ok(ReconcileOutcome::Skipped(SkipReason::NoSignal));
        };
        let at = status
            .and_then(|s| {
                if progress.is_finished() {
                    s.completion_time
                } else {
                    s.start_time
                }
            })
            .unwrap_or_else(Utc::now);
        let transition = StepTransition {
            status: StepStatus::from(progress),
            message,
            at,
        };
        let applied = self
            .gateway
            .advance_step(key.pipeline_id, key.task_name, &transition)
            .await?
            .applied();
        tracing::info!(
            manifest_id = %manifest.id,
            pipeline_id = key.pipeline_id,
            task_name = key.task_name,
            status = %transition.status,
            applied,
            "step status reconciled"
        );
        Ok(outcome(applied))
    }

    #[tracing::instrument(skip_all, fields(pipeline_run = %run.metadata.name))]
    pub async fn on_pipeline_run(
        &self,
        run: &PipelineRun,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let pipeline_id = match pipeline_run_key(run) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "dropping uncorrelated pipeline run event");
                return Ok(ReconcileOutcome::Skipped(SkipReason::Uncorrelated));
            }
        };
        let Some(manifest) = self.repo.manifest_by_pipeline(pipeline_id).await? else {
            tracing::warn!(pipeline_id, "no manifest for pipeline run");
            return Ok(ReconcileOutcome::Skipped(SkipReason::UnknownRecord));
        };
        if manifest.status.is_terminal() {
            tracing::debug!(manifest_id = %manifest.id, status = %manifest.status, "manifest already terminal");
            return Ok(ReconcileOutcome::Skipped(SkipReason::Terminal));
        }
        let Some((progress, _)) = run_progress(run.status.as_ref()) else {
            tracing::debug!(pipeline_id, "pipeline run has no usable condition");
            return Ok(ReconcileOutcome::Skipped(SkipReason::NoSignal));
        };
        let status = ManifestStatus::from(progress);
        let applied = self
            .gateway
            .advance_manifest(pipeline_id, status)
            .await?
            .applied();
        tracing::info!(
            manifest_id = %manifest.id,
            pipeline_id,
            status = %status,
            applied,
            "manifest status reconciled"
        );
        Ok(outcome(applied))
    }
}

#[async_trait]
impl ResourceListener<TaskRun> for PipelineReconciler {
    async fn on_event(&self, resource: &TaskRun) -> Result<ReconcileOutcome, ReconcileError> {
        self.on_task_run(resource).await
    }
}

#[async_trait]
impl ResourceListener<PipelineRun> for PipelineReconciler {
    async fn on_event(&self, resource: &PipelineRun) -> Result<ReconcileOutcome, ReconcileError> {
        self.on_pipeline_run(resource).await
    }
}
