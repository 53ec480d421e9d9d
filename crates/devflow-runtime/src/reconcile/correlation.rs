//! Wire conventions that tie external resources back to devflow records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::engine::{GitOpsApplication, PipelineRun, TaskRun};
use crate::store::JobId;
use crate::trace::TraceContext;

pub const LABEL_PIPELINE_RUN: &str = "tekton.dev/pipelineRun";
pub const LABEL_PIPELINE_TASK: &str = "tekton.dev/pipelineTask";
pub const LABEL_JOB_ID: &str = "devflow/job-id";
pub const LABEL_MANIFEST_NAME: &str = "devflow/manifest-name";
pub const ANNOTATION_TRACE_ID: &str = "devflow/trace-id";
pub const ANNOTATION_SPAN_ID: &str = "devflow/span-id";

/// `<pipeline>-run-<unix-seconds>`; becomes the Manifest's `pipeline_id`.
pub fn pipeline_run_name(pipeline: &str, at: DateTime<Utc>) -> String {
    format!("{pipeline}-run-{}", at.timestamp())
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("{kind} has no name")]
    Unnamed { kind: &'static str },
    #[error("{kind} {name} is missing label {label}")]
    MissingLabel {
        kind: &'static str,
        name: String,
        label: &'static str,
    },
    #[error("{kind} {name} carries malformed job id {value:?}")]
    MalformedJobId {
        kind: &'static str,
        name: String,
        value: String,
    },
}

/// Where a task run's status belongs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRunKey<'a> {
    pub pipeline_id: &'a str,
    pub task_name: &'a str,
    pub task_run: &'a str,
}

pub fn pipeline_run_key(run: &PipelineRun) -> Result<&str, CorrelationError> {
    let name = run.metadata.name.trim();
    if name.is_empty() {
        return Err(CorrelationError::Unnamed {
            kind: "PipelineRun",
        });
    }
    Ok(name)
}

pub fn task_run_key(run: &TaskRun) -> Result<TaskRunKey<'_>, CorrelationError> {
    const KIND: &str = "TaskRun";
    let task_run = run.metadata.name.trim();
    if task_run.is_empty() {
        return Err(CorrelationError::Unnamed { kind: KIND });
    }
    let missing = |label| CorrelationError::MissingLabel {
        kind: KIND,
        name: task_run.to_string(),
        label,
    };
    let pipeline_id = run
        .metadata
        .label(LABEL_PIPELINE_RUN)
        .ok_or_else(|| missing(LABEL_PIPELINE_RUN))?;
    let task_name = run
        .metadata
        .label(LABEL_PIPELINE_TASK)
        .ok_or_else(|| missing(LABEL_PIPELINE_TASK))?;
    Ok(TaskRunKey {
        pipeline_id,
        task_name,
        task_run,
    })
}

pub fn job_key(app: &GitOpsApplication) -> Result<JobId, CorrelationError> {
    const KIND: &str = "Application";
    let name = app.metadata.name.clone();
    let value = app
        .metadata
        .label(LABEL_JOB_ID)
        .ok_or_else(|| CorrelationError::MissingLabel {
            kind: KIND,
            name: name.clone(),
            label: LABEL_JOB_ID,
        })?;
    value
        .trim()
        .parse()
        .map_err(|_| CorrelationError::MalformedJobId {
            kind: KIND,
            name,
            value: value.to_string(),
        })
}

/// Trace annotations stamped onto submitted resources.
pub fn trace_annotations(trace: &TraceContext) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ANNOTATION_TRACE_ID.to_string(), trace.trace_id.clone()),
        (ANNOTATION_SPAN_ID.to_string(), trace.span_id.clone()),
    ])
}
