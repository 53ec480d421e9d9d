//! Document store façade.
//!
//! [DocumentStore] is the untyped document contract both backends implement;
//! [Repository] layers typed record access on top of it. Status fields are
//! only ever written through [DocumentStore::update_one_guarded], which the
//! [StatusGateway](crate::reconcile::StatusGateway) drives.

pub mod memory;
pub mod models;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub use memory::InMemoryDocumentStore;
pub use models::{
    Application, ApplicationId, DeploymentSpec, Document, Job, JobId, JobType, MalformedId,
    Manifest, ManifestId, ManifestStep, ServicePort, ServiceSpec, Timestamps,
};
#[cfg(feature = "mongodb")]
pub use mongo::MongoDocumentStore;
pub use repository::Repository;

/// Errors raised by store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document already exists in {collection}: {id}")]
    Conflict { collection: &'static str, id: String },
    #[error("document decode failed: {0}")]
    Decode(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("store driver error: {0}")]
    Driver(String),
}

pub(crate) fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Driver(format!("{prefix}: {e}"))
}

/// Result of a single-document update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A document matched the filter and was written.
    Applied,
    /// Nothing matched: record missing, or its guard rejected the write.
    Skipped,
}

impl UpdateOutcome {
    pub fn applied(self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

pub const FIELD_STATUS: &str = "status";
pub const FIELD_MESSAGE: &str = "message";
pub const FIELD_START_TIME: &str = "start_time";
pub const FIELD_END_TIME: &str = "end_time";
pub const FIELD_TASK_RUN: &str = "task_run";
pub const FIELD_PIPELINE_ID: &str = "pipeline_id";
pub const FIELD_STEPS: &str = "steps";
pub const FIELD_STEP_NAME: &str = "name";
pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const FIELD_ID: &str = "_id";

/// One `$set` entry. For step selectors the path is relative to the matched
/// step element, otherwise to the document root.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldUpdate {
    pub path: &'static str,
    pub value: Value,
}

impl FieldUpdate {
    pub fn new(path: &'static str, value: impl Into<Value>) -> Self {
        Self {
            path,
            value: value.into(),
        }
    }

    pub fn timestamp(path: &'static str, at: DateTime<Utc>) -> Self {
        // RFC 3339 with `Z`, readable by chrono's serde impl.
        Self {
            path,
            value: Value::String(at.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)),
        }
    }
}

/// Identifies exactly one record (or one step inside a manifest).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordSelector {
    Manifest { pipeline_id: String },
    ManifestStep { pipeline_id: String, task_name: String },
    Job { job_id: JobId },
}

impl RecordSelector {
    pub fn collection(&self) -> &'static str {
        match self {
            RecordSelector::Manifest { .. } | RecordSelector::ManifestStep { .. } => {
                Manifest::COLLECTION
            }
            RecordSelector::Job { .. } => Job::COLLECTION,
        }
    }

    pub fn targets_step(&self) -> bool {
        matches!(self, RecordSelector::ManifestStep { .. })
    }
}

/// Extra predicate conjoined with the selector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Guard {
    /// Target `status` must not be one of these wire values.
    StatusNotIn(Vec<&'static str>),
    /// Target `task_run` must be unset, empty, or already equal to this value.
    UnboundOr(String),
    /// Target field must be absent or null.
    Unset(&'static str),
}

impl Guard {
    /// Evaluates the guard against the matched element (document or step).
    pub fn admits(&self, target: &Value) -> bool {
        match self {
            Guard::StatusNotIn(terminal) => match target.get(FIELD_STATUS).and_then(Value::as_str) {
                Some(status) => !terminal.contains(&status),
                None => true,
            },
            Guard::UnboundOr(task_run) => match target.get(FIELD_TASK_RUN) {
                None | Some(Value::Null) => true,
                Some(Value::String(bound)) => bound.is_empty() || bound == task_run,
                Some(_) => false,
            },
            Guard::Unset(field) => matches!(target.get(*field), None | Some(Value::Null)),
        }
    }
}

/// A filter-guarded single-document update: applied only when the selector
/// matches and the guard admits the current value, atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct GuardedUpdate {
    pub selector: RecordSelector,
    pub guard: Guard,
    pub set: Vec<FieldUpdate>,
    /// Written to the document's `updated_at` when the update applies.
    pub touched_at: DateTime<Utc>,
}

/// Untyped document persistence contract.
///
/// Implementations must apply [DocumentStore::update_one_guarded] as one
/// atomic compare-and-set on a single document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts a new document; an existing id is a [StoreError::Conflict].
    async fn insert(
        &self,
        collection: &'static str,
        id: &str,
        document: Value,
    ) -> Result<(), StoreError>;

    async fn find_by_id(&self, collection: &'static str, id: &str)
        -> Result<Option<Value>, StoreError>;

    /// First document whose top-level string `field` equals `value`.
    async fn find_one_by(
        &self,
        collection: &'static str,
        field: &'static str,
        value: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Unconditional `$set` on the document root. Used for non-status fields.
    async fn update_by_id(
        &self,
        collection: &'static str,
        id: &str,
        set: &[FieldUpdate],
        touched_at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn update_one_guarded(&self, update: &GuardedUpdate) -> Result<UpdateOutcome, StoreError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_guard_rejects_terminal_values() {
        let guard = Guard::StatusNotIn(vec!["succeeded", "failed"]);
        assert!(guard.admits(&json!({"status": "running"})));
        assert!(guard.admits(&json!({})));
        assert!(!guard.admits(&json!({"status": "failed"})));
    }

    #[test]
    fn bind_guard_is_first_write_wins() {
        let guard = Guard::UnboundOr("tr-1".into());
        assert!(guard.admits(&json!({"name": "build"})));
        assert!(guard.admits(&json!({"task_run": null})));
        assert!(guard.admits(&json!({"task_run": ""})));
        assert!(guard.admits(&json!({"task_run": "tr-1"})));
        assert!(!guard.admits(&json!({"task_run": "tr-0"})));
    }

    #[test]
    fn unset_guard_admits_missing_or_null_only() {
        let guard = Guard::Unset(FIELD_START_TIME);
        assert!(guard.admits(&json!({"name": "build"})));
        assert!(guard.admits(&json!({"start_time": null})));
        assert!(!guard.admits(&json!({"start_time": "2026-03-01T09:15:00Z"})));
    }
}
