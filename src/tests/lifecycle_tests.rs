use std::time::Duration;

use super::test_helpers::{new_task, spec, TestHarness};
use crate::agent::testing::{ScriptedAgent, ScriptedAttempt};
use crate::agent::AgentError;
use crate::models::{OrchestrationStatus, TaskStatus};

#[tokio::test]
async fn trivial_success_end_to_end() {
    let harness = TestHarness::with_agent(ScriptedAgent::always_succeeding(
        "created /tmp/hello.txt with the requested content",
    ))
    .await;

    let task = harness
        .scheduler
        .submit(new_task("write /tmp/hello.txt containing 'hi'"))
        .await
        .unwrap();
    assert_eq!(task.id, 1);
    assert_eq!(task.status, TaskStatus::Pending);

    let task = harness.wait_terminal(task.id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(!task.final_summary.as_deref().unwrap_or_default().is_empty());
    assert!(task.started_at.is_some());
    assert!(task.ended_at.is_some());

    let summary = std::fs::read_to_string(&task.summary_log_path).unwrap();
    assert!(summary.contains("using tool"), "summary was: {summary}");
}

#[tokio::test]
async fn diamond_dag_respects_dependency_order() {
    // Every attempt parks long enough that start/end stamps separate
    // cleanly across the dependency edges.
    let attempts: Vec<ScriptedAttempt> = (0..4)
        .map(|_| ScriptedAttempt::success("ok").with_delay(Duration::from_millis(200)))
        .collect();
    let harness = TestHarness::with_agent(ScriptedAgent::new(attempts)).await;

    let orch = harness
        .orchestrator
        .submit_group(vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["a"]),
            spec("d", &["b", "c"]),
        ])
        .await
        .unwrap();

    let orch = harness.wait_orchestration_terminal(orch.id).await;
    assert_eq!(orch.status, OrchestrationStatus::Completed);
    assert_eq!(orch.total_tasks, 4);
    assert_eq!(orch.completed_tasks, 4);
    assert_eq!(orch.failed_tasks, 0);
    assert_eq!(orch.skipped_tasks, 0);

    let members = harness.store.orchestration_members(orch.id).await.unwrap();
    let by_identifier = |id: &str| {
        members
            .iter()
            .find(|t| t.task_identifier.as_deref() == Some(id))
            .unwrap()
    };
    let (a, b, c, d) = (
        by_identifier("a"),
        by_identifier("b"),
        by_identifier("c"),
        by_identifier("d"),
    );

    assert!(members.iter().all(|t| t.status == TaskStatus::Completed));
    // a finishes before b and c start; d starts only after both finish.
    assert!(b.started_at.unwrap() >= a.ended_at.unwrap());
    assert!(c.started_at.unwrap() >= a.ended_at.unwrap());
    assert!(d.started_at.unwrap() >= b.ended_at.unwrap());
    assert!(d.started_at.unwrap() >= c.ended_at.unwrap());
}

#[tokio::test]
async fn failed_root_skips_the_whole_downstream_graph() {
    // A's only attempt dies on a permanent failure; nothing else may run.
    let harness = TestHarness::with_agent(ScriptedAgent::new(vec![ScriptedAttempt::failure(
        AgentError::BinaryMissing {
            searched: vec!["claude".to_string()],
        },
    )]))
    .await;

    let orch = harness
        .orchestrator
        .submit_group(vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["a"]),
            spec("d", &["b", "c"]),
        ])
        .await
        .unwrap();

    let orch = harness.wait_orchestration_terminal(orch.id).await;
    assert_eq!(orch.status, OrchestrationStatus::Failed);
    assert_eq!(orch.completed_tasks, 0);
    assert_eq!(orch.failed_tasks, 1);
    assert_eq!(orch.skipped_tasks, 3);

    // No executor launched for b, c, or d: the agent ran exactly once.
    assert_eq!(harness.agent.invocation_count(), 1);

    let members = harness.store.orchestration_members(orch.id).await.unwrap();
    for member in &members {
        match member.task_identifier.as_deref() {
            Some("a") => {
                assert_eq!(member.status, TaskStatus::Failed);
                assert!(member
                    .error_message
                    .as_deref()
                    .unwrap()
                    .starts_with("[agent_missing]"));
            }
            _ => {
                assert_eq!(member.status, TaskStatus::Skipped);
                // Skipped is distinct from failed, and names the upstream.
                assert!(member
                    .error_message
                    .as_deref()
                    .unwrap()
                    .contains("dependency"));
            }
        }
    }
}

#[tokio::test]
async fn transient_failure_recovers_within_the_attempt_budget() {
    let harness = TestHarness::with_agent(ScriptedAgent::new(vec![
        ScriptedAttempt::failure(AgentError::Stream {
            message: "connection reset".to_string(),
        }),
        ScriptedAttempt::success("recovered on the second attempt"),
    ]))
    .await;

    let task = harness
        .scheduler
        .submit(new_task("flaky network day in /srv"))
        .await
        .unwrap();
    let task = harness.wait_terminal(task.id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(harness.agent.invocation_count(), 2);
    let detailed = std::fs::read_to_string(&task.detailed_log_path).unwrap();
    assert_eq!(detailed.matches("retry 1:").count(), 1);
}

#[tokio::test]
async fn wait_after_dependencies_delays_the_successor() {
    let harness = TestHarness::with_agent(ScriptedAgent::always_succeeding("ok")).await;

    let mut delayed = spec("b", &["a"]);
    delayed.wait_after_dependencies = 0.4;
    let orch = harness
        .orchestrator
        .submit_group(vec![spec("a", &[]), delayed])
        .await
        .unwrap();

    let orch = harness.wait_orchestration_terminal(orch.id).await;
    assert_eq!(orch.status, OrchestrationStatus::Completed);

    let members = harness.store.orchestration_members(orch.id).await.unwrap();
    let a = members
        .iter()
        .find(|t| t.task_identifier.as_deref() == Some("a"))
        .unwrap();
    let b = members
        .iter()
        .find(|t| t.task_identifier.as_deref() == Some("b"))
        .unwrap();
    let gap = b.started_at.unwrap() - a.ended_at.unwrap();
    assert!(
        gap >= chrono::Duration::milliseconds(380),
        "gap was only {gap}"
    );
}

#[tokio::test]
async fn orchestration_cancel_reaches_waiting_members() {
    // The root parks for a long time so the dependent is still waiting
    // when the cancel lands.
    let harness = TestHarness::with_agent(ScriptedAgent::new(vec![
        ScriptedAttempt::success("slow root").with_delay(Duration::from_secs(30)),
    ]))
    .await;

    let orch = harness
        .orchestrator
        .submit_group(vec![spec("a", &[]), spec("b", &["a"])])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let orch = harness.orchestrator.cancel(orch.id).await.unwrap();
    assert_eq!(orch.status, OrchestrationStatus::Cancelled);

    // Cancellation is best-effort: wait until every member settled.
    let mut members = Vec::new();
    for _ in 0..600 {
        members = harness.store.orchestration_members(orch.id).await.unwrap();
        if members.iter().all(|t| t.status.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for member in &members {
        assert!(
            matches!(member.status, TaskStatus::Cancelled | TaskStatus::Skipped),
            "member {:?} ended {:?}",
            member.task_identifier,
            member.status
        );
    }
}

#[tokio::test]
async fn cancel_is_idempotent_on_terminal_tasks() {
    let harness = TestHarness::with_agent(ScriptedAgent::always_succeeding("done")).await;
    let task = harness.scheduler.submit(new_task("quick /tmp job")).await.unwrap();
    harness.wait_terminal(task.id).await;

    for _ in 0..3 {
        let status = harness.scheduler.cancel(task.id).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn orchestrated_members_recover_after_a_crash() {
    // First life: admit a two-task chain whose root parks forever.
    let root_dir = tempfile::TempDir::new().unwrap();
    let orch_id;
    {
        let first = TestHarness::with_agent_at(
            ScriptedAgent::new(vec![
                ScriptedAttempt::success("root").with_delay(Duration::from_secs(600)),
            ]),
            root_dir.path(),
        )
        .await;
        let orch = first
            .orchestrator
            .submit_group(vec![spec("a", &[]), spec("b", &["a"])])
            .await
            .unwrap();
        orch_id = orch.id;

        // Wait until the root is actually running, as it would be at the
        // moment a real process dies.
        for _ in 0..200 {
            let members = first.store.orchestration_members(orch_id).await.unwrap();
            if members.iter().any(|t| t.status == TaskStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Simulate a hard kill: leak the harness without any shutdown
        // signal. Its executor stays parked on the scripted delay and
        // never finalizes, so the row is stranded in `running`.
        std::mem::forget(first);
    }

    // Second life over the same data directory.
    let second = TestHarness::with_agent_at(
        ScriptedAgent::always_succeeding("recovered after restart"),
        root_dir.path(),
    )
    .await;
    let rearmed = second.orchestrator.recover().await.unwrap();
    assert_eq!(rearmed, 1);

    let orch = second.wait_orchestration_terminal(orch_id).await;
    assert_eq!(orch.status, OrchestrationStatus::Completed);
    assert_eq!(orch.completed_tasks, 2);

    let members = second.store.orchestration_members(orch_id).await.unwrap();
    assert_eq!(members.len(), 2, "recovery must never duplicate rows");
    let a = members
        .iter()
        .find(|t| t.task_identifier.as_deref() == Some("a"))
        .unwrap();
    let detailed = std::fs::read_to_string(&a.detailed_log_path).unwrap();
    assert!(
        detailed.contains("requeued after service restart"),
        "detailed log was: {detailed}"
    );
}
