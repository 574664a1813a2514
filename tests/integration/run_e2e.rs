//! End-to-end orchestration runs.
//!
//! These tests verify that full runs land every change set on the
//! integration branch and finish with the right outcome. Agents are
//! scripted in-process; no external commands are spawned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use maestro::core::task::{Role, TaskStatus};
use maestro::orchestration::engine::{RunOutcome, RunSnapshot};

use crate::fixtures::{
    graph_of, read_file, EngineBuilder, ObservantAgent, OrderedWriterAgent, ReportingAgent,
    WriterAgent,
};

/// Test: Happy path over a linear chain
/// Given architect -> developer -> tester tasks
/// When the engine runs
/// Then every task lands and the run completes
#[tokio::test]
async fn test_linear_chain_completes() {
    let (graph, _ids) = graph_of(&[
        ("design", Role::Architect, "core", &[]),
        ("implement", Role::Developer, "api", &["design"]),
        ("verify", Role::Tester, "tests", &["implement"]),
    ]);

    let (mut engine, repo) = EngineBuilder::new(Arc::new(WriterAgent::new())).build("ship it", graph);
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.tasks_done, 3);
    assert_eq!(summary.tasks_blocked, 0);
    assert_eq!(summary.cost_spent, 3, "One assignment per task");
    assert!(summary.findings.is_empty());

    // Every change set reached the integration worktree.
    let integration = repo.integration_dir();
    for file in ["core.txt", "api.txt", "tests.txt"] {
        assert!(
            read_file(&integration, file).is_some(),
            "{} should be on the integration branch",
            file
        );
    }
}

/// Test: Dependents see their dependencies' landed changes
/// Given task b depends on task a
/// When b is dispatched
/// Then b's worktree already contains a's change set
#[tokio::test]
async fn test_dependent_builds_on_landed_changes() {
    let (graph, _ids) = graph_of(&[
        ("base layer", Role::Architect, "core", &[]),
        ("api layer", Role::Developer, "api", &["base layer"]),
    ]);

    let agent = Arc::new(ObservantAgent {
        depends_on_file: "core.txt".to_string(),
    });
    let (mut engine, repo) = EngineBuilder::new(agent).build("layered", graph);
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(
        read_file(&repo.integration_dir(), "api.txt").as_deref(),
        Some("saw-dep\n"),
        "api task should have seen core.txt in its worktree"
    );
}

/// Test: Independent tasks fan out in a single round
/// Given three independent developer tasks and three developer slots
/// When the engine runs
/// Then all three land and the run finishes without extra rounds
#[tokio::test]
async fn test_independent_tasks_single_round() {
    let (graph, _ids) = graph_of(&[
        ("one", Role::Developer, "alpha", &[]),
        ("two", Role::Developer, "beta", &[]),
        ("three", Role::Developer, "gamma", &[]),
    ]);

    let (mut engine, repo) = EngineBuilder::new(Arc::new(WriterAgent::new()))
        .with_slots(Role::Developer, 3)
        .build("fan out", graph);
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.tasks_done, 3);
    assert_eq!(summary.rounds, 1, "All three fit in one round");

    let integration = repo.integration_dir();
    for file in ["alpha.txt", "beta.txt", "gamma.txt"] {
        assert!(read_file(&integration, file).is_some());
    }
}

/// Test: A slow agent does not gate work its peers have unlocked
/// Given a fast task, an unrelated slow task, and a dependent of the fast
/// task, with two developer slots
/// When the fast task lands while the slow one is still running
/// Then the dependent is dispatched without waiting for the slow task
#[tokio::test]
async fn test_slow_agent_does_not_gate_unlocked_work() {
    let (graph, _ids) = graph_of(&[
        ("fast", Role::Developer, "fast", &[]),
        ("slow", Role::Developer, "slow", &[]),
        ("child", Role::Developer, "child", &["fast"]),
    ]);

    let agent = Arc::new(OrderedWriterAgent::new(&[("slow", 800)]));
    let (mut engine, _repo) = EngineBuilder::new(agent.clone())
        .with_slots(Role::Developer, 2)
        .build("no stragglers", graph);

    let run_started = Instant::now();
    let summary = engine.run().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.tasks_done, 3);

    let started = agent.started.lock().unwrap();
    let child_latency = started["child"].duration_since(run_started);
    assert!(
        child_latency < Duration::from_millis(600),
        "child waited {:?} despite its dependency landing early",
        child_latency
    );
}

/// Test: An agent-supplied change-set reference is recorded as-is
/// Given an agent that reports its own opaque change-set reference
/// When the task lands
/// Then the snapshot carries that reference instead of a derived commit id
#[tokio::test]
async fn test_agent_change_set_reference_recorded() {
    let (graph, ids) = graph_of(&[("tracked", Role::Developer, "core", &[])]);

    let agent = Arc::new(ReportingAgent {
        reference: "ext-ref-001".to_string(),
    });
    let (mut engine, repo) = EngineBuilder::new(agent).build("tracked run", graph);
    let summary = engine.run().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);

    let snapshot = RunSnapshot::load(&repo.snapshot_path()).unwrap();
    let task = snapshot.tasks.iter().find(|t| t.id == ids["tracked"]).unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.change_set.as_deref(), Some("ext-ref-001"));
}

/// Test: Snapshot persistence
/// Given a snapshot path
/// When the run finishes
/// Then the snapshot on disk carries the outcome and per-task state
#[tokio::test]
async fn test_snapshot_written_with_outcome() {
    let (graph, _ids) = graph_of(&[("only", Role::Developer, "core", &[])]);

    let (mut engine, repo) = EngineBuilder::new(Arc::new(WriterAgent::new())).build("persist", graph);
    let summary = engine.run().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);

    let snapshot = RunSnapshot::load(&repo.snapshot_path()).unwrap();
    assert_eq!(snapshot.goal, "persist");
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(snapshot.tasks.len(), 1);
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Done);
    assert_eq!(snapshot.tasks[0].subsystem, "core");
}
