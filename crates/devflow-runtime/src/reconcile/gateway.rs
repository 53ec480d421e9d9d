//! Conditional status writes.
//!
//! Every Manifest, step and Job status change goes through [StatusGateway]: a
//! single-document update whose filter also requires the stored status to be
//! non-terminal. A stale or duplicate write simply matches nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::status::{JobStatus, Lifecycle, ManifestStatus, StepStatus};
use crate::store::{
    DocumentStore, FieldUpdate, Guard, GuardedUpdate, JobId, RecordSelector, StoreError,
    UpdateOutcome, FIELD_END_TIME, FIELD_MESSAGE, FIELD_START_TIME, FIELD_STATUS, FIELD_TASK_RUN,
};

/// New state for one manifest step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepTransition {
    pub status: StepStatus,
    pub message: String,
    /// Start time when `status` is running, end time when it is terminal.
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StatusGateway {
    store: Arc<dyn DocumentStore>,
}

impl StatusGateway {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Applies `set` to the record `selector` names, unless its status is in
    /// `terminal`. Zero matches is [UpdateOutcome::Skipped], not an error.
    pub async fn apply_if_not_terminal<L: Lifecycle>(
        &self,
        selector: RecordSelector,
        terminal: &[L],
        set: Vec<FieldUpdate>,
    ) -> Result<UpdateOutcome, StoreError> {
        if set.is_empty() {
            return Err(StoreError::InvalidUpdate("empty field set".to_string()));
        }
        if let Some(bound) = set.iter().find(|u| u.path == FIELD_TASK_RUN) {
            return Err(StoreError::InvalidUpdate(format!(
                "{} is written only by the execution bind",
                bound.path
            )));
        }
        let update = GuardedUpdate {
            selector,
            guard: Guard::StatusNotIn(terminal.iter().map(Lifecycle::as_str).collect()),
            set,
            touched_at: Utc::now(),
        };
        self.store.update_one_guarded(&update).await
    }

    /// Binds `task_run` to a step. First bind wins; repeating the same bind is
    /// harmless, a different run is [UpdateOutcome::Skipped].
    pub async fn bind_step_execution(
        &self,
        pipeline_id: &str,
        task_name: &str,
        task_run: &str,
    ) -> Result<UpdateOutcome, StoreError> {
        let update = GuardedUpdate {
            selector: RecordSelector::ManifestStep {
                pipeline_id: pipeline_id.to_string(),
                task_name: task_name.to_string(),
            },
            guard: Guard::UnboundOr(task_run.to_string()),
            set: vec![FieldUpdate::new(FIELD_TASK_RUN, task_run)],
            touched_at: Utc::now(),
        };
        self.store.update_one_guarded(&update).await
    }

    pub async fn advance_manifest(
        &self,
        pipeline_id: &str,
        status: ManifestStatus,
    ) -> Result<UpdateOutcome, StoreError> {
        self.apply_if_not_terminal(
            RecordSelector::Manifest {
                pipeline_id: pipeline_id.to_string(),
            },
            ManifestStatus::TERMINAL,
            vec![FieldUpdate::new(FIELD_STATUS, status.as_str())],
        )
        .await
    }

    pub async fn advance_step(
        &self,
        pipeline_id: &str,
        task_name: &str,
        transition: &StepTransition,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut set = vec![
            FieldUpdate::new(FIELD_STATUS, transition.status.as_str()),
            FieldUpdate::new(FIELD_MESSAGE, transition.message.as_str()),
        ];
        if transition.status.is_terminal() {
            set.push(FieldUpdate::timestamp(FIELD_END_TIME, transition.at));
        }
        let outcome = self
            .apply_if_not_terminal(
                RecordSelector::ManifestStep {
                    pipeline_id: pipeline_id.to_string(),
                    task_name: task_name.to_string(),
                },
                StepStatus::TERMINAL,
                set,
            )
            .await?;
        if outcome.applied() && transition.status == StepStatus::Running {
            self.stamp_step_start(pipeline_id, task_name, transition.at)
                .await?;
        }
        Ok(outcome)
    }

    /// Sets a step's start time once. Later Running observations leave it.
    async fn stamp_step_start(
        &self,
        pipeline_id: &str,
        task_name: &str,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        let update = GuardedUpdate {
            selector: RecordSelector::ManifestStep {
                pipeline_id: pipeline_id.to_string(),
                task_name: task_name.to_string(),
            },
            guard: Guard::Unset(FIELD_START_TIME),
            set: vec![FieldUpdate::timestamp(FIELD_START_TIME, at)],
            touched_at: Utc::now(),
        };
        self.store.update_one_guarded(&update).await
    }

    pub async fn advance_job(
        &self,
        job_id: &JobId,
        status: JobStatus,
    ) -> Result<UpdateOutcome, StoreError> {
        self.apply_if_not_terminal(
            RecordSelector::Job {
                job_id: job_id.clone(),
            },
            JobStatus::TERMINAL,
            vec![FieldUpdate::new(FIELD_STATUS, status.as_str())],
        )
        .await
    }
}
