mod common;

use std::time::Duration;

use common::{next_matching, wait_until, Harness};
use phaseline::engine::PhaseOutcome;
use phaseline::storage::TaskStore;
use phaseline::task::{PhaseStatus, TaskStatus, TaskWeight};
use phaseline::workflow::{ConditionOp, PhaseCondition, Workflow, WorkflowPhase};
use phaseline::{CreateTaskRequest, EventPayload, GateType, OrchestratorError};

#[tokio::test]
async fn test_create_assigns_workflow_from_weight() {
    let h = Harness::new();

    let task = h
        .engine
        .create(CreateTaskRequest::new("Add cache").with_weight(TaskWeight::Small))
        .await
        .unwrap();
    assert_eq!(task.workflow_id.as_deref(), Some("implement-small"));
    assert_eq!(task.status, TaskStatus::Created);

    let explicit = h
        .engine
        .create(
            CreateTaskRequest::new("Add cache")
                .with_weight(TaskWeight::Small)
                .with_workflow("two-step"),
        )
        .await
        .unwrap();
    assert_eq!(explicit.workflow_id.as_deref(), Some("two-step"));

    let opted_out = h
        .engine
        .create(
            CreateTaskRequest::new("Notes")
                .with_weight(TaskWeight::Large)
                .with_workflow(""),
        )
        .await
        .unwrap();
    assert_eq!(opted_out.workflow_id.as_deref(), Some(""));
}

#[tokio::test]
async fn test_create_validation() {
    let h = Harness::new();

    let err = h.engine.create(CreateTaskRequest::new("  ")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let err = h
        .engine
        .create(CreateTaskRequest::new("x").with_workflow("no-such-workflow"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}

#[tokio::test]
async fn test_run_completes_all_phases() {
    let h = Harness::new();
    h.runner.script(
        "build",
        vec![Ok(PhaseOutcome::new("built")
            .with_tokens(100, 20)
            .with_cost(0.25)
            .with_commit("abc123"))],
    );
    let task = h
        .engine
        .create(CreateTaskRequest::new("Two step").with_workflow("two-step"))
        .await
        .unwrap();
    let mut events = h.subscribe(&task.id);

    let started = h.engine.run(&task.id).await.unwrap();
    assert_eq!(started.status, TaskStatus::Running);
    assert_eq!(started.current_phase.as_deref(), Some("plan"));

    let complete = next_matching(&mut events, |e| matches!(e.payload, EventPayload::Complete(_))).await;
    if let EventPayload::Complete(data) = complete.payload {
        assert_eq!(data.status, TaskStatus::Completed);
        assert_eq!(data.commit_sha.as_deref(), Some("abc123"));
    }

    h.wait_settled(&task.id, TaskStatus::Completed).await;
    let done = h.engine.get(&task.id).await.unwrap();
    assert_eq!(h.runner.phases_run(), vec!["plan", "build"]);
    assert_eq!(done.phase_status("plan"), PhaseStatus::Completed);
    assert_eq!(done.phase_status("build"), PhaseStatus::Completed);
    assert_eq!(done.input_tokens, 100);
    assert_eq!(done.output_tokens, 20);
    assert!(done.completed_at.is_some());
    assert!((done.cost_usd - 0.25).abs() < 1e-9);
}

#[tokio::test]
async fn test_run_is_exclusive_under_concurrency() {
    let h = Harness::new();
    h.runner.set_delay(Duration::from_millis(200));
    let task = h
        .engine
        .create(CreateTaskRequest::new("Race").with_workflow("two-step"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let id = task.id.clone();
        handles.push(tokio::spawn(async move { engine.run(&id).await }));
    }
    let mut started = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => started += 1,
            Err(e) => assert!(e.is_conflict(), "unexpected error: {}", e),
        }
    }
    assert_eq!(started, 1);

    h.wait_settled(&task.id, TaskStatus::Completed).await;
    assert_eq!(h.runner.phases_run(), vec!["plan", "build"]);
}

#[tokio::test]
async fn test_failed_attempt_is_retried_with_context() {
    let h = Harness::new();
    h.runner.script(
        "build",
        vec![Err("tests failed".into()), Err("lint failed".into())],
    );
    let task = h
        .engine
        .create(CreateTaskRequest::new("Retry").with_workflow("retrying"))
        .await
        .unwrap();

    h.engine.run(&task.id).await.unwrap();
    h.wait_settled(&task.id, TaskStatus::Completed).await;

    let calls = h.runner.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].iteration, 1);
    assert!(calls[0].retry_context.is_none());
    assert!(calls[1].retry_context.as_deref().unwrap().contains("Attempt 1 failed"));
    assert!(calls[2].retry_context.as_deref().unwrap().contains("lint failed"));

    let done = h.engine.get(&task.id).await.unwrap();
    let state = done.phase("build").unwrap();
    assert_eq!(state.iterations, 3);
    assert!(state.retry_context.is_none());
    assert!(state.error.is_none());
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_task() {
    let h = Harness::new();
    h.runner.script(
        "build",
        vec![Err("a".into()), Err("b".into()), Err("c".into())],
    );
    let task = h
        .engine
        .create(CreateTaskRequest::new("Doomed").with_workflow("retrying"))
        .await
        .unwrap();
    let mut events = h.subscribe(&task.id);

    h.engine.run(&task.id).await.unwrap();
    let fatal = next_matching(&mut events, |e| {
        matches!(&e.payload, EventPayload::Error(data) if data.fatal)
    })
    .await;
    if let EventPayload::Error(data) = fatal.payload {
        assert_eq!(data.phase.as_deref(), Some("build"));
    }

    h.wait_settled(&task.id, TaskStatus::Failed).await;
    let failed = h.engine.get(&task.id).await.unwrap();
    assert_eq!(failed.phase_status("build"), PhaseStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("failed after 3 attempts"));
    assert_eq!(h.runner.calls().len(), 3);
}

#[tokio::test]
async fn test_restarted_driver_keeps_retry_budget() {
    let h = Harness::new();
    let task = h
        .engine
        .create(CreateTaskRequest::new("Restarted").with_workflow("retrying"))
        .await
        .unwrap();

    // Two attempts already spent by a driver that is gone
    let mut paused = h.engine.get(&task.id).await.unwrap();
    paused.set_status(TaskStatus::Paused);
    paused.current_phase = Some("build".into());
    let state = paused.phase_mut("build");
    state.status = PhaseStatus::Running;
    state.iterations = 2;
    state.retry_context = Some("Attempt 2 failed: flaky".into());
    h.store.save_task(&paused).await.unwrap();

    h.runner.script("build", vec![Err("still broken".into())]);
    h.engine.resume(&task.id).await.unwrap();
    h.wait_settled(&task.id, TaskStatus::Failed).await;

    let calls = h.runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].iteration, 3);
    let failed = h.engine.get(&task.id).await.unwrap();
    assert_eq!(failed.phase_status("build"), PhaseStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("failed after 3 attempts"));
}

#[tokio::test]
async fn test_auto_gate_rejection_consumes_an_attempt() {
    let h = Harness::new();
    h.runner.script(
        "spec",
        vec![Ok(PhaseOutcome::new("")), Ok(PhaseOutcome::new("the spec"))],
    );
    h.workflows
        .create(
            Workflow::new("spec-only", "Spec only")
                .with_phase(WorkflowPhase::new("spec", 1).with_max_iterations(2)),
        )
        .unwrap();
    let task = h
        .engine
        .create(CreateTaskRequest::new("Spec").with_workflow("spec-only"))
        .await
        .unwrap();

    h.engine.run(&task.id).await.unwrap();
    h.wait_settled(&task.id, TaskStatus::Completed).await;

    let calls = h.runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1]
        .retry_context
        .as_deref()
        .unwrap()
        .contains("auto gate rejected"));
}

#[tokio::test]
async fn test_false_condition_skips_phase() {
    let h = Harness::new();
    h.workflows
        .create(
            Workflow::new("conditional", "Conditional")
                .with_phase(WorkflowPhase::new("build", 1).with_gate(GateType::Skip))
                .with_phase(
                    WorkflowPhase::new("docs", 2)
                        .with_gate(GateType::Skip)
                        .with_condition(PhaseCondition::field(
                            "task.weight",
                            ConditionOp::In,
                            serde_json::json!(["medium", "large"]),
                        )),
                ),
        )
        .unwrap();
    let task = h
        .engine
        .create(
            CreateTaskRequest::new("Small change")
                .with_weight(TaskWeight::Small)
                .with_workflow("conditional"),
        )
        .await
        .unwrap();

    h.engine.run(&task.id).await.unwrap();
    h.wait_settled(&task.id, TaskStatus::Completed).await;

    let done = h.engine.get(&task.id).await.unwrap();
    assert_eq!(h.runner.phases_run(), vec!["build"]);
    assert_eq!(done.phase_status("docs"), PhaseStatus::Skipped);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let h = Harness::new();
    h.runner.set_delay(Duration::from_millis(150));
    let task = h
        .engine
        .create(CreateTaskRequest::new("Pausable").with_workflow("two-step"))
        .await
        .unwrap();

    h.engine.run(&task.id).await.unwrap();
    let paused = h.engine.pause(&task.id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);

    // The in-flight attempt finishes, the next phase waits
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.runner.calls().len() <= 1);
    assert_eq!(h.engine.get(&task.id).await.unwrap().status, TaskStatus::Paused);
    assert!(h.engine.is_executing(&task.id));

    let err = h.engine.pause(&task.id).await.unwrap_err();
    assert!(err.is_conflict());

    let resumed = h.engine.resume(&task.id).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Running);
    h.wait_settled(&task.id, TaskStatus::Completed).await;
    assert_eq!(h.runner.phases_run(), vec!["plan", "build"]);
}

#[tokio::test]
async fn test_pause_requires_running_task() {
    let h = Harness::new();
    let task = h
        .engine
        .create(CreateTaskRequest::new("Idle").with_workflow("two-step"))
        .await
        .unwrap();

    assert!(h.engine.pause(&task.id).await.unwrap_err().is_conflict());
    assert!(h.engine.resume(&task.id).await.unwrap_err().is_conflict());
    assert!(h.engine.pause("TASK-999").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_cancel_stops_running_phase() {
    let h = Harness::new();
    h.runner.set_delay(Duration::from_secs(30));
    let task = h
        .engine
        .create(CreateTaskRequest::new("Long").with_workflow("two-step"))
        .await
        .unwrap();

    h.engine.run(&task.id).await.unwrap();
    let runner = h.runner.clone();
    wait_until(move || {
        let runner = runner.clone();
        async move { runner.calls().len() == 1 }
    })
    .await;

    let cancelled = h.engine.cancel(&task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    h.wait_settled(&task.id, TaskStatus::Cancelled).await;

    let task = h.engine.get(&task.id).await.unwrap();
    assert_eq!(task.phase_status("plan"), PhaseStatus::Pending);
    assert_eq!(h.runner.calls().len(), 1);

    // Cancelled is terminal
    assert!(h.engine.run(&task.id).await.unwrap_err().is_conflict());
    assert!(h.engine.cancel(&task.id).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn test_delete_running_task_conflicts() {
    let h = Harness::new();
    h.runner.set_delay(Duration::from_secs(30));
    let task = h
        .engine
        .create(CreateTaskRequest::new("Busy").with_workflow("two-step"))
        .await
        .unwrap();

    h.engine.run(&task.id).await.unwrap();
    assert!(h.engine.delete(&task.id).await.unwrap_err().is_conflict());

    h.engine.cancel(&task.id).await.unwrap();
    h.wait_settled(&task.id, TaskStatus::Cancelled).await;
    h.engine.delete(&task.id).await.unwrap();
    assert!(h.engine.get(&task.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_run_without_workflow() {
    let h = Harness::new();
    let task = h
        .engine
        .create(CreateTaskRequest::new("Loose").with_workflow(""))
        .await
        .unwrap();

    let err = h.engine.run(&task.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
    assert_eq!(h.engine.get(&task.id).await.unwrap().status, TaskStatus::Created);
    assert!(!h.engine.is_executing(&task.id));
}

#[tokio::test]
async fn test_list_filters_by_status() {
    let h = Harness::new();
    let first = h
        .engine
        .create(CreateTaskRequest::new("One").with_workflow("two-step"))
        .await
        .unwrap();
    h.engine
        .create(CreateTaskRequest::new("Two").with_workflow("two-step"))
        .await
        .unwrap();

    h.engine.run(&first.id).await.unwrap();
    h.wait_settled(&first.id, TaskStatus::Completed).await;

    assert_eq!(h.engine.list(None).await.unwrap().len(), 2);
    let completed = h.engine.list(Some(TaskStatus::Completed)).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, first.id);
    assert_eq!(h.engine.list(Some(TaskStatus::Created)).await.unwrap().len(), 1);
}
