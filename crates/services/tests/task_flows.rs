//! End-to-end task lifecycle flows over an on-disk SQLite database, real
//! fake-agent executions and stubbed git/GitHub collaborators.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{TestHarness, make_job, recv_message};
use db::models::{
    execution::{Execution, ExecutionStatus},
    execution_log::ExecutionLog,
    plan::{Plan, PlanStatus},
    pull_request::{CreatePullRequest, PrStatus, PullRequest},
    task::{Task, TaskStatus},
};
use executors::executors::{AiType, fake::FAIL_MARKER};
use services::services::{
    github::RemotePrStatus,
    jobs::{
        JOB_PR_STATUS_SYNC, JOB_TASK_IMPLEMENTATION, JOB_TASK_PLANNING, ProcessorConfig,
        TaskImplementationPayload, TaskPlanningPayload,
    },
    message::MessageType,
    queue::JobError,
};
use uuid::Uuid;

fn planning_payload(task: &Task) -> serde_json::Value {
    serde_json::to_value(TaskPlanningPayload {
        version: 1,
        task_id: task.id,
        project_id: task.project_id,
        branch_name: "df/test-branch".to_string(),
        ai_type: AiType::FakeCode,
    })
    .unwrap()
}

fn implementation_payload(task: &Task) -> serde_json::Value {
    serde_json::to_value(TaskImplementationPayload {
        version: 1,
        task_id: task.id,
        project_id: task.project_id,
        ai_type: AiType::FakeCode,
    })
    .unwrap()
}

#[tokio::test]
async fn planning_happy_path_produces_reviewable_plan() {
    let harness = TestHarness::new().await;
    let project = harness.create_project().await;
    let task = harness.create_task(&project, None, TaskStatus::Todo).await;
    let mut events = harness.subscribe(project.id).await;

    let job = make_job(&harness.db, JOB_TASK_PLANNING, planning_payload(&task)).await;
    harness.processor.handle_task_planning(&job).await.unwrap();

    let task = harness
        .wait_for_task_status(task.id, TaskStatus::PlanReviewing)
        .await;
    assert!(task.worktree_path.is_some());
    assert!(task.branch_name.is_some());

    let plan = Plan::find_latest_by_task_id(&harness.db.pool, task.id)
        .await
        .unwrap()
        .expect("planning should have produced a plan");
    assert_eq!(plan.status, PlanStatus::Reviewing);
    assert!(plan.content.contains("## Plan"));

    let executions = Execution::find_by_task_id(&harness.db.pool, task.id)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
    let result = executions[0].result.as_ref().unwrap();
    assert!(result.0.output.contains("## Plan"));

    let logs = ExecutionLog::find_by_execution_id(&harness.db.pool, executions[0].id)
        .await
        .unwrap();
    assert!(!logs.is_empty());
    let line_nos: Vec<i64> = logs.iter().map(|l| l.line_no).collect();
    assert!(line_nos.windows(2).all(|w| w[0] < w[1]));

    let status_changed = recv_message(
        &mut events,
        MessageType::StatusChanged,
        Duration::from_secs(5),
    )
    .await
    .expect("a status_changed event should have been broadcast");
    assert_eq!(status_changed.data["entity_type"], "task");
}

#[tokio::test]
async fn planning_failure_reverts_to_todo_with_failed_execution() {
    let harness = TestHarness::new().await;
    let project = harness.create_project().await;
    let task = harness
        .create_task(&project, Some(FAIL_MARKER), TaskStatus::Todo)
        .await;

    let job = make_job(&harness.db, JOB_TASK_PLANNING, planning_payload(&task)).await;
    harness.processor.handle_task_planning(&job).await.unwrap();

    let task = harness.wait_for_task_status(task.id, TaskStatus::Todo).await;

    let executions = Execution::find_by_task_id(&harness.db.pool, task.id)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    let error = executions[0].error.as_ref().unwrap();
    assert!(error.contains("fake agent failure"));

    assert!(
        Plan::find_latest_by_task_id(&harness.db.pool, task.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn unknown_ai_type_fails_job_construction() {
    let harness = TestHarness::new().await;
    let project = harness.create_project().await;
    let task = harness.create_task(&project, None, TaskStatus::Todo).await;

    let mut payload = planning_payload(&task);
    payload["ai_type"] = serde_json::json!("copilot");
    let job = make_job(&harness.db, JOB_TASK_PLANNING, payload).await;

    let err = harness
        .processor
        .handle_task_planning(&job)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));
    let task = Task::find_by_id(&harness.db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Todo);
}

#[tokio::test]
async fn implementation_requires_reviewed_plan() {
    let harness = TestHarness::new().await;
    let project = harness.create_project().await;
    let task = harness
        .create_task(&project, None, TaskStatus::PlanReviewing)
        .await;
    let task = harness.attach_worktree(&task).await;
    // A draft plan is not enough to start implementing.
    Plan::create(&harness.db.pool, task.id, "## Plan\ndraft", Uuid::new_v4())
        .await
        .unwrap();

    let job = make_job(
        &harness.db,
        JOB_TASK_IMPLEMENTATION,
        implementation_payload(&task),
    )
    .await;
    let err = harness
        .processor
        .handle_task_implementation(&job)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));

    let task = Task::find_by_id(&harness.db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::PlanReviewing);
    assert!(
        Execution::find_by_task_id(&harness.db.pool, task.id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn implementation_happy_path_opens_pr_and_moves_to_review() {
    let harness = TestHarness::new().await;
    let project = harness.create_project().await;
    let task = harness
        .create_task(&project, Some("Wrap the client in retries"), TaskStatus::PlanReviewing)
        .await;
    let task = harness.attach_worktree(&task).await;
    let plan = Plan::create(&harness.db.pool, task.id, "## Plan\n1. do it", Uuid::new_v4())
        .await
        .unwrap();
    Plan::update_status(&harness.db.pool, plan.id, PlanStatus::Approved)
        .await
        .unwrap();
    let mut events = harness.subscribe(project.id).await;

    let job = make_job(
        &harness.db,
        JOB_TASK_IMPLEMENTATION,
        implementation_payload(&task),
    )
    .await;
    harness
        .processor
        .handle_task_implementation(&job)
        .await
        .unwrap();

    let task = harness
        .wait_for_task_status(task.id, TaskStatus::CodeReviewing)
        .await;

    let executions = Execution::find_by_task_id(&harness.db.pool, task.id)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);

    let pr_created = recv_message(&mut events, MessageType::PrCreated, Duration::from_secs(5))
        .await
        .expect("a pr_created event should have been broadcast");
    assert_eq!(pr_created.data["pull_request"]["github_pr_number"], 42);

    let prs = PullRequest::find_by_task_id(&harness.db.pool, task.id)
        .await
        .unwrap();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].github_pr_number, 42);
    assert_eq!(prs[0].repository, "acme/widget");
    assert_eq!(prs[0].status, PrStatus::Open);
}

#[tokio::test]
async fn merged_pr_completes_the_task() {
    let harness = TestHarness::new().await;
    let project = harness.create_project().await;
    let task = harness
        .create_task(&project, None, TaskStatus::CodeReviewing)
        .await;
    let pr = PullRequest::create(
        &harness.db.pool,
        &CreatePullRequest {
            task_id: task.id,
            repository: "acme/widget".to_string(),
            github_pr_number: 42,
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap();

    let merged_at = "2025-01-01T00:00:00Z".parse().unwrap();
    *harness.github.remote.lock().unwrap() = Some(RemotePrStatus {
        number: 42,
        url: "https://github.com/acme/widget/pull/42".to_string(),
        status: PrStatus::Merged,
        merged_at: Some(merged_at),
        closed_at: Some(merged_at),
        merge_commit_sha: Some("abc123".to_string()),
        merged_by: Some("octocat".to_string()),
    });
    let mut events = harness.subscribe(project.id).await;

    let job = make_job(
        &harness.db,
        JOB_PR_STATUS_SYNC,
        serde_json::json!({"version": 1}),
    )
    .await;
    harness.processor.handle_pr_status_sync(&job).await.unwrap();

    let task = Task::find_by_id(&harness.db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Done);

    let prs = PullRequest::find_by_task_id(&harness.db.pool, task.id)
        .await
        .unwrap();
    assert_eq!(prs[0].status, PrStatus::Merged);
    assert_eq!(prs[0].merged_at, Some(merged_at));
    assert_eq!(prs[0].merge_commit_sha.as_deref(), Some("abc123"));
    assert_eq!(prs[0].merged_by.as_deref(), Some("octocat"));
    assert_eq!(prs[0].id, pr.id);

    let event = recv_message(
        &mut events,
        MessageType::PrStatusChanged,
        Duration::from_secs(5),
    )
    .await
    .expect("a pr_status_changed event should have been broadcast");
    assert_eq!(event.data["old_status"], "open");
    assert_eq!(event.data["new_status"], "merged");
}

#[tokio::test]
async fn transition_to_current_status_writes_and_emits_nothing() {
    let harness = TestHarness::new().await;
    let project = harness.create_project().await;
    let task = harness.create_task(&project, None, TaskStatus::Todo).await;
    let mut events = harness.subscribe(project.id).await;

    harness
        .processor
        .transition_task(&task, TaskStatus::Todo)
        .await
        .unwrap();
    let stored = Task::find_by_id(&harness.db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.updated_at, task.updated_at);
    assert!(
        recv_message(
            &mut events,
            MessageType::StatusChanged,
            Duration::from_millis(300),
        )
        .await
        .is_none()
    );

    // Edges missing from the transition table are rejected outright.
    let err = harness
        .processor
        .transition_task(&task, TaskStatus::Implementing)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Validation(_)));
}

#[tokio::test]
async fn cleanup_refuses_unsafe_worktree_path() {
    let config = ProcessorConfig {
        // Everything with a worktree is immediately eligible.
        worktree_retention: chrono::Duration::zero(),
        ..Default::default()
    };
    let harness = TestHarness::with_config(config).await;
    let project = harness.create_project().await;
    let task = harness.create_task(&project, None, TaskStatus::Done).await;
    Task::update_worktree(&harness.db.pool, task.id, "df/test-branch", "/etc")
        .await
        .unwrap();
    // Let updated_at fall behind the eligibility cutoff.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(Utc::now() > task.updated_at);

    let report = harness
        .processor
        .cleanup_stale_worktrees()
        .await
        .unwrap();
    assert_eq!(report.refused_unsafe, 1);
    assert_eq!(report.succeeded, 0);

    // Task state is untouched, so the operator can intervene.
    let task = Task::find_by_id(&harness.db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.worktree_path.as_deref(), Some("/etc"));
}

#[tokio::test]
async fn cleanup_removes_stale_worktrees_and_clears_the_task() {
    let config = ProcessorConfig {
        worktree_retention: chrono::Duration::zero(),
        ..Default::default()
    };
    let harness = TestHarness::with_config(config).await;
    let project = harness.create_project().await;
    let task = harness.create_task(&project, None, TaskStatus::Done).await;
    let task = harness.attach_worktree(&task).await;
    let worktree_path = task.worktree_path.clone().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = harness
        .processor
        .cleanup_stale_worktrees()
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);

    let task = Task::find_by_id(&harness.db.pool, task.id)
        .await
        .unwrap()
        .unwrap();
    assert!(task.worktree_path.is_none());
    assert!(!std::path::Path::new(&worktree_path).exists());
    assert_eq!(
        harness.git.deleted_branches.lock().unwrap().as_slice(),
        ["df/test-branch"]
    );
}
