//! Handlers racing on one Manifest or one Job from many tasks at once.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use chrono::{TimeZone, Utc};
use tokio::task::JoinSet;

use common::{condition, finished_task_run, pipeline_run, task_run, Harness, RecordingEngines};
use devflow_runtime::engine::{
    ApplicationStatus, GitOpsApplication, HealthStatus, ObjectMeta, OperationState, SyncStatus,
};
use devflow_runtime::reconcile::correlation::LABEL_JOB_ID;
use devflow_runtime::reconcile::{JobStatus, Lifecycle, ManifestStatus, SkipReason, StepStatus};
use devflow_runtime::release::{CreateJobRequest, CreateManifestRequest};
use devflow_runtime::store::{Job, JobId, Manifest};
use devflow_runtime::{
    GitOpsReconciler, PipelineReconciler, ReconcileError, ReconcileOutcome, TraceContext,
};

const TASKS: [&str; 5] = ["git-clone", "build", "unit-test", "package", "push"];
const FAILING_TASK: &str = "unit-test";

fn app_event(
    job_id: &JobId,
    sync: &str,
    health: &str,
    phase: Option<&str>,
) -> GitOpsApplication {
    let mut meta = ObjectMeta::named("checkout-api", "argo-cd");
    meta.labels
        .insert(LABEL_JOB_ID.to_string(), job_id.to_string());
    GitOpsApplication {
        metadata: meta,
        status: Some(ApplicationStatus {
            sync: SyncStatus {
                status: sync.into(),
            },
            health: HealthStatus {
                status: health.into(),
            },
            operation_state: phase.map(|phase| OperationState {
                phase: phase.into(),
                message: None,
            }),
        }),
        ..GitOpsApplication::default()
    }
}

async fn manifest(harness: &Harness) -> Manifest {
    let app = harness.application("checkout-api").await;
    harness
        .service
        .create_manifest(
            CreateManifestRequest {
                application_id: app.id,
                branch: None,
            },
            &TraceContext::generate(),
        )
        .await
        .unwrap()
}

async fn job(harness: &Harness, manifest: &Manifest) -> Job {
    harness
        .service
        .create_job(
            CreateJobRequest {
                manifest_id: manifest.id.clone(),
                job_type: Some("upgrade".into()),
            },
            &TraceContext::generate(),
        )
        .await
        .unwrap()
}

async fn drain(
    mut set: JoinSet<Result<ReconcileOutcome, ReconcileError>>,
) -> Vec<ReconcileOutcome> {
    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
        outcomes.push(joined.expect("handler task panicked").expect("handler failed"));
    }
    outcomes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_task_and_pipeline_runs_lose_no_step_update() {
    let harness = Harness::new(RecordingEngines::with_pipeline(&TASKS, &["notify"]));
    let manifest = manifest(&harness).await;
    let pipeline_id = manifest.pipeline_id.clone();
    let reconciler = PipelineReconciler::new(harness.dyn_store());
    let started_at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
    let finished_at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 4, 0).unwrap();

    let mut set = JoinSet::new();
    for round in 0..3 {
        for task in TASKS.iter().chain(["notify"].iter()) {
            let outcome = if *task == FAILING_TASK { "False" } else { "True" };
            let run_name = format!("{pipeline_id}-{task}");
            let mut running = condition("Unknown", "Running");
            running.start_time = Some(started_at);
            let running = task_run(&pipeline_id, task, &run_name, Some(running));
            let finished = finished_task_run(&pipeline_id, task, outcome, finished_at);

            let r = reconciler.clone();
            set.spawn(async move { r.on_task_run(&running).await });
            let r = reconciler.clone();
            set.spawn(async move { r.on_task_run(&finished).await });
        }
        let status = if round == 0 {
            condition("Unknown", "Running")
        } else {
            condition("False", "Tasks Completed: 5 (Failed: 1)")
        };
        let run = pipeline_run(&pipeline_id, Some(status));
        let r = reconciler.clone();
        set.spawn(async move { r.on_pipeline_run(&run).await });
    }
    let outcomes = drain(set).await;
    assert_eq!(outcomes.len(), 3 * (TASKS.len() + 1) * 2 + 3);

    let stored = harness.repo().manifest(&manifest.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ManifestStatus::Failed);
    for step in &stored.steps {
        let expected = if step.name == FAILING_TASK {
            StepStatus::Failed
        } else {
            StepStatus::Succeeded
        };
        assert_eq!(step.status, expected, "step {}", step.name);
        assert_eq!(step.end_time, Some(finished_at), "step {}", step.name);
        assert_eq!(
            step.task_run.as_deref(),
            Some(format!("{pipeline_id}-{}", step.name).as_str())
        );
    }

    // Every terminal state holds against a late replay.
    for task in TASKS {
        let late = finished_task_run(&pipeline_id, task, "True", Utc::now());
        assert_eq!(
            reconciler.on_task_run(&late).await.unwrap(),
            ReconcileOutcome::Skipped(SkipReason::Terminal)
        );
    }
    let late = pipeline_run(&pipeline_id, Some(condition("True", "done")));
    assert!(!reconciler.on_pipeline_run(&late).await.unwrap().applied());
    let again = harness.repo().manifest(&manifest.id).await.unwrap().unwrap();
    assert_eq!(again.steps, stored.steps);
    assert_eq!(again.status, ManifestStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_application_events_settle_the_job_once() {
    let harness = Harness::new(RecordingEngines::with_pipeline(&["build"], &[]));
    let manifest = manifest(&harness).await;
    let job = job(&harness, &manifest).await;
    let reconciler = GitOpsReconciler::new(harness.dyn_store());

    let mut set = JoinSet::new();
    for i in 0..24 {
        let event = match i % 4 {
            0 => app_event(&job.id, "Synced", "Healthy", Some("Succeeded")),
            1 => app_event(&job.id, "Synced", "Degraded", None),
            _ => app_event(&job.id, "OutOfSync", "Progressing", Some("Running")),
        };
        let r = reconciler.clone();
        set.spawn(async move { r.on_application(&event).await });
    }
    let outcomes = drain(set).await;
    assert_eq!(outcomes.len(), 24);

    let stored = harness.repo().job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_terminal_reports_leave_one_final_status() {
    let harness = Harness::new(RecordingEngines::with_pipeline(&["build"], &[]));
    let manifest = manifest(&harness).await;
    let job = job(&harness, &manifest).await;
    let reconciler = GitOpsReconciler::new(harness.dyn_store());
    let healthy = app_event(&job.id, "Synced", "Healthy", Some("Succeeded"));
    let failed = app_event(&job.id, "OutOfSync", "Missing", Some("Failed"));

    let mut set = JoinSet::new();
    for i in 0..16 {
        let event = if i % 2 == 0 { healthy.clone() } else { failed.clone() };
        let r = reconciler.clone();
        set.spawn(async move { r.on_application(&event).await });
    }
    let outcomes = drain(set).await;
    assert!(outcomes.iter().any(|o| o.applied()));

    let settled = harness.repo().job(&job.id).await.unwrap().unwrap();
    assert!(settled.status.is_terminal());
    for event in [&healthy, &failed] {
        assert_eq!(
            reconciler.on_application(event).await.unwrap(),
            ReconcileOutcome::Skipped(SkipReason::Terminal)
        );
    }
    let after = harness.repo().job(&job.id).await.unwrap().unwrap();
    assert_eq!(after.status, settled.status);
}
