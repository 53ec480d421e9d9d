//! devflow runtime: status reconciliation and release orchestration.
//!
//! The pipeline engine and the GitOps engine push status asynchronously; the
//! reconcilers in [reconcile] fold those events into devflow's own Manifest and
//! Job records. Every status write goes through the
//! [StatusGateway](reconcile::StatusGateway), a filter-guarded single-document
//! update that never overwrites a terminal status, so handlers stay idempotent
//! under duplicate and out-of-order delivery.
//!
//! The synchronous, user-triggered side lives in [release]: creating a
//! Manifest submits a pipeline run, creating a Job submits a GitOps
//! application.

pub mod config;
pub mod engine;
pub mod logging;
pub mod reconcile;
pub mod release;
pub mod store;
pub mod trace;

pub use config::{ConfigError, DevflowConfig};
pub use engine::{EngineError, GitOpsEngine, PipelineEngine, WorkspaceAllocator};
pub use reconcile::{
    GitOpsReconciler, PipelineReconciler, ReconcileError, ReconcileOutcome, StatusGateway,
    WatchLoop,
};
pub use release::{ReleaseError, ReleaseService, ReleaseSettings};
pub use store::{DocumentStore, InMemoryDocumentStore, Repository, StoreError};
pub use trace::TraceContext;
