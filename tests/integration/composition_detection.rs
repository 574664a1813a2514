//! Composition failure detection across subsystems.
//!
//! Two change sets that each pass in isolation but fail together must
//! produce a finding, reopen the implicated tasks, and converge once
//! the re-done work composes cleanly.

use std::sync::Arc;

use maestro::core::task::Role;
use maestro::orchestration::engine::{RunOutcome, RunSnapshot};
use maestro::validation::composition::Severity;

use crate::fixtures::{
    graph_of, read_file, ConditionalTests, EngineBuilder, OrderedWriterAgent, SharedFileAgent,
    WriterAgent,
};

/// Test: Emergent failure yields one finding and a convergent re-run
/// Given two independent tasks whose first attempts pass alone but fail together
/// When the integration suite fails
/// Then exactly one finding implicates both, both are reopened, and the
/// second attempts land cleanly
#[tokio::test]
async fn test_composition_failure_reopens_and_converges() {
    let (graph, ids) = graph_of(&[
        ("memory manager", Role::Developer, "mm", &[]),
        ("scheduler hooks", Role::Developer, "sched", &[]),
    ]);

    // First attempts write v1; v1+v1 only breaks when combined.
    let tests = ConditionalTests::new(|dir| {
        let mm = std::fs::read_to_string(dir.join("mm.txt")).ok();
        let sched = std::fs::read_to_string(dir.join("sched.txt")).ok();
        if mm.as_deref() == Some("v1\n") && sched.as_deref() == Some("v1\n") {
            Some("mm and sched v1 deadlock under load".to_string())
        } else {
            None
        }
    });

    let (mut engine, repo) = EngineBuilder::new(Arc::new(WriterAgent::new()))
        .with_tests(Arc::new(tests))
        .with_slots(Role::Developer, 2)
        .build("compose", graph);
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.tasks_done, 2);
    assert_eq!(summary.findings.len(), 1, "Exactly one finding per failed integration");

    let finding = &summary.findings[0];
    assert_eq!(finding.severity, Severity::Confirmed);
    let mut subsystems = finding.subsystems.clone();
    subsystems.sort();
    assert_eq!(subsystems, vec!["mm".to_string(), "sched".to_string()]);
    assert!(
        subsystems.contains(&finding.trigger),
        "the trigger is the last subsystem of the failing prefix: {}",
        finding.trigger
    );
    assert!(
        finding.detail.contains("suite"),
        "the record carries the failing integrated summary: {}",
        finding.detail
    );
    assert_eq!(
        finding.regressed_tests,
        vec!["suite".to_string()],
        "the finding names the test that passed isolated but failed integrated"
    );

    // Both tasks were reopened before their second attempts.
    let snapshot = RunSnapshot::load(&repo.snapshot_path()).unwrap();
    for title in ["memory manager", "scheduler hooks"] {
        let task = snapshot
            .tasks
            .iter()
            .find(|t| t.id == ids[title])
            .expect("task in snapshot");
        assert!(
            task.reopen_reason
                .as_deref()
                .is_some_and(|r| r.contains("composition failure")),
            "{} should carry a reopen reason, got {:?}",
            title,
            task.reopen_reason
        );
    }

    // Second attempts landed.
    let integration = repo.integration_dir();
    assert_eq!(read_file(&integration, "mm.txt").as_deref(), Some("v2\n"));
    assert_eq!(read_file(&integration, "sched.txt").as_deref(), Some("v2\n"));
    assert_eq!(summary.cost_spent, 4, "Two attempts per task");
}

/// Test: Bisection narrows a wide integration to a small prefix
/// Given four passing subsystems where only the two earliest landers interact badly
/// When the integration suite fails
/// Then the finding implicates just that prefix within the probe bound
#[tokio::test]
async fn test_bisection_narrows_to_prefix() {
    let (graph, _ids) = graph_of(&[
        ("dev one", Role::Developer, "s1", &[]),
        ("dev two", Role::Developer, "s2", &[]),
        ("dev three", Role::Developer, "s3", &[]),
        ("dev four", Role::Developer, "s4", &[]),
    ]);

    // Staggered finishes pin land order to s1, s2, s3, s4.
    let agent = Arc::new(OrderedWriterAgent::new(&[
        ("s1", 0),
        ("s2", 40),
        ("s3", 80),
        ("s4", 120),
    ]));

    let tests = ConditionalTests::new(|dir| {
        let s1_v1 = std::fs::read_to_string(dir.join("s1.txt")).is_ok_and(|c| c == "v1\n");
        let s2_v1 = std::fs::read_to_string(dir.join("s2.txt")).is_ok_and(|c| c == "v1\n");
        if s1_v1 && s2_v1 {
            Some("s1 and s2 first cuts clash".to_string())
        } else {
            None
        }
    });

    let (mut engine, _repo) = EngineBuilder::new(agent)
        .with_tests(Arc::new(tests))
        .with_slots(Role::Developer, 4)
        .build("narrow", graph);
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.findings.len(), 1);
    let finding = &summary.findings[0];
    assert_eq!(finding.severity, Severity::Confirmed);
    assert_eq!(
        finding.subsystems,
        vec!["s1".to_string(), "s2".to_string()],
        "only the minimal failing prefix is implicated"
    );
    assert!(
        finding.probes_used <= 2,
        "at most ceil(log2(4)) probes, used {}",
        finding.probes_used
    );
    assert_eq!(summary.tasks_done, 4);
}

/// Test: Exhausted probe budget over-approximates
/// Given a bisection budget of zero
/// When an emergent failure appears
/// Then the finding implicates every changed subsystem as unresolved
#[tokio::test]
async fn test_probe_budget_exhaustion_over_approximates() {
    let (graph, _ids) = graph_of(&[
        ("memory manager", Role::Developer, "mm", &[]),
        ("scheduler hooks", Role::Developer, "sched", &[]),
    ]);

    let tests = ConditionalTests::new(|dir| {
        let both_v1 = std::fs::read_to_string(dir.join("mm.txt"))
            .is_ok_and(|c| c == "v1\n")
            && std::fs::read_to_string(dir.join("sched.txt")).is_ok_and(|c| c == "v1\n");
        if both_v1 {
            Some("interaction".to_string())
        } else {
            None
        }
    });

    let (mut engine, _repo) = EngineBuilder::new(Arc::new(WriterAgent::new()))
        .with_tests(Arc::new(tests))
        .with_slots(Role::Developer, 2)
        .with_config(|c| c.bisection_budget = 0)
        .build("no probes", graph);
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.findings.len(), 1);
    let finding = &summary.findings[0];
    assert_eq!(finding.severity, Severity::UnresolvedBisection);
    assert_eq!(finding.probes_used, 0);
    assert_eq!(finding.subsystems.len(), 2, "everything implicated unprobed");
}

/// Test: Merge conflicts are a task failure, not an engine error
/// Given two tasks racing on the same file
/// When the loser hits a conflict
/// Then it retries from the updated integration branch and lands
#[tokio::test]
async fn test_merge_conflict_retried_from_updated_base() {
    let (graph, _ids) = graph_of(&[
        ("first writer", Role::Developer, "alpha", &[]),
        ("second writer", Role::Developer, "beta", &[]),
    ]);

    let agent = Arc::new(SharedFileAgent {
        file: "shared.txt".to_string(),
    });
    let (mut engine, repo) = EngineBuilder::new(agent)
        .with_slots(Role::Developer, 2)
        .build("contention", graph);
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.tasks_done, 2);
    assert_eq!(summary.cost_spent, 3, "one conflict means one extra attempt");

    let snapshot = RunSnapshot::load(&repo.snapshot_path()).unwrap();
    let total_retries: u32 = snapshot.tasks.iter().map(|t| t.retries).sum();
    assert_eq!(total_retries, 1);
    assert!(read_file(&repo.integration_dir(), "shared.txt").is_some());
}
