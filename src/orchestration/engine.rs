//! The orchestration loop.
//!
//! Each round dispatches every ready task the slots allow, then drains
//! completions one at a time, re-dispatching newly unlocked work after each
//! so a slow agent never holds up tasks its peers have already freed.
//! Change sets that pass isolated validation land as they arrive; once the
//! round's in-flight work is empty the integrated tree is validated.
//! Integration failures with clean isolated records go to the composition
//! validator, and its findings reopen the implicated tasks. The loop ends
//! when every task is done, a budget runs out, or no further progress is
//! possible.

use crate::collab::MergeOutcome;
use crate::config::Config;
use crate::core::graph::TaskGraph;
use crate::core::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::scheduler::{AgentScheduler, AssignmentCompletion, AssignmentResult};
use crate::validation::composition::{CompositionFinding, CompositionValidator, IntegrationProber};
use crate::validation::pipeline::ValidationPipeline;
use crate::validation::report::{BuildOutcome, Scope, ValidationReport};
use crate::{mlog, mlog_debug, mlog_error, mlog_warn, RepoOps};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every task reached Done.
    Completed,
    /// The round or cost budget ran out with work remaining.
    BudgetExhausted,
    /// No task could make progress: unrunnable dependencies or a stall.
    DeadlockDetected,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::BudgetExhausted => write!(f, "budget_exhausted"),
            RunOutcome::DeadlockDetected => write!(f, "deadlock_detected"),
        }
    }
}

/// Serializable record of one composition finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingRecord {
    pub subsystems: Vec<String>,
    pub trigger: String,
    pub severity: crate::validation::composition::Severity,
    pub probes_used: u32,
    pub detail: String,
    /// Tests that passed in every isolated run but failed integrated.
    #[serde(default)]
    pub regressed_tests: Vec<String>,
    pub round: u32,
}

impl FindingRecord {
    fn from_finding(finding: &CompositionFinding, round: u32) -> Self {
        Self {
            subsystems: finding.subsystems.clone(),
            trigger: finding.trigger.clone(),
            severity: finding.severity,
            probes_used: finding.probes_used,
            detail: finding.integrated.clone(),
            regressed_tests: finding.regressed_tests.clone(),
            round,
        }
    }
}

/// Final result handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub rounds: u32,
    pub cost_spent: u64,
    pub tasks_done: usize,
    pub tasks_blocked: usize,
    pub findings: Vec<FindingRecord>,
}

/// Point-in-time view of one task, for snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub title: String,
    pub role: crate::core::task::Role,
    pub subsystem: String,
    pub status: TaskStatus,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reopen_reason: Option<String>,
}

/// Persisted run state, written at the end of every round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub goal: String,
    pub round: u32,
    pub cost_spent: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    pub tasks: Vec<TaskSnapshot>,
    pub findings: Vec<FindingRecord>,
    pub saved_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// A change set merged into the integration branch, in land order.
#[derive(Debug, Clone)]
struct LandedChange {
    task: TaskId,
    subsystem: String,
    branch: String,
}

pub struct OrchestrationLoop {
    goal: String,
    graph: TaskGraph,
    scheduler: AgentScheduler,
    pipeline: ValidationPipeline,
    composition: CompositionValidator,
    repo: RepoOps,
    config: Config,
    worktrees_dir: PathBuf,
    snapshot_path: Option<PathBuf>,
    integration_worktree: PathBuf,
    base_commit: String,
    landed: Vec<LandedChange>,
    findings: Vec<FindingRecord>,
    /// Worktree and branch of each in-flight assignment.
    active: HashMap<TaskId, (PathBuf, String)>,
    /// Per-task attempt counter, used for branch names.
    attempts: HashMap<TaskId, u32>,
    /// Tasks blocked by a reopen cascade, awaiting requeue.
    cascaded: HashSet<TaskId>,
    cost_spent: u64,
    round: u32,
    rounds_without_transition: u32,
}

impl OrchestrationLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        goal: impl Into<String>,
        graph: TaskGraph,
        scheduler: AgentScheduler,
        pipeline: ValidationPipeline,
        composition: CompositionValidator,
        repo: RepoOps,
        config: Config,
        worktrees_dir: PathBuf,
        snapshot_path: Option<PathBuf>,
    ) -> Result<Self> {
        let base_commit = repo.head_commit()?;
        let integration_worktree = worktrees_dir.join("integration");
        Ok(Self {
            goal: goal.into(),
            graph,
            scheduler,
            pipeline,
            composition,
            repo,
            config,
            worktrees_dir,
            snapshot_path,
            integration_worktree,
            base_commit,
            landed: Vec::new(),
            findings: Vec::new(),
            active: HashMap::new(),
            attempts: HashMap::new(),
            cascaded: HashSet::new(),
            cost_spent: 0,
            round: 0,
            rounds_without_transition: 0,
        })
    }

    /// Drive the run to an outcome.
    pub async fn run(&mut self) -> Result<RunSummary> {
        std::fs::create_dir_all(&self.worktrees_dir)?;
        if !self.integration_worktree.exists() {
            self.repo.create_worktree_at(
                &self.config.integration_branch,
                &self.base_commit,
                &self.integration_worktree,
            )?;
        }
        mlog!(
            "Run started: goal={} tasks={} base={}",
            self.goal,
            self.graph.task_count(),
            &self.base_commit[..8.min(self.base_commit.len())]
        );

        let outcome = loop {
            self.round += 1;
            if self.round > self.config.max_rounds {
                mlog_warn!("Round budget exhausted at {}", self.round - 1);
                break RunOutcome::BudgetExhausted;
            }
            mlog_debug!("Round {} begins", self.round);
            let transitions_before = self.graph.transition_count();

            self.requeue_cascaded();
            self.graph.promote_ready();
            let dispatched = self.dispatch().await?;

            if self.graph.all_done() {
                break RunOutcome::Completed;
            }
            if dispatched == 0 && self.scheduler.in_flight() == 0 {
                mlog_warn!(
                    "No runnable tasks and none in flight: {:?}",
                    self.graph.status_counts()
                );
                break RunOutcome::DeadlockDetected;
            }

            // Drain completions one at a time, dispatching work unlocked by
            // each before waiting on the next. Slow agents keep their slot
            // without gating tasks their peers have already freed.
            let mut landed_this_round = false;
            while self.scheduler.in_flight() > 0 {
                match self.scheduler.next_completion().await {
                    Some(completion) => {
                        landed_this_round |= self.handle_completion(completion).await?;
                        self.graph.promote_ready();
                        self.dispatch().await?;
                    }
                    None => break,
                }
            }

            if landed_this_round {
                self.run_integration_validation().await?;
            }

            // Stall: consecutive rounds in which no task changed status
            // while work was still outstanding.
            if self.graph.transition_count() == transitions_before {
                self.rounds_without_transition += 1;
                if self.rounds_without_transition >= self.config.stall_threshold {
                    mlog_warn!(
                        "Stalled: {} rounds without a status transition",
                        self.rounds_without_transition
                    );
                    break RunOutcome::DeadlockDetected;
                }
            } else {
                self.rounds_without_transition = 0;
            }

            self.save_snapshot(None)?;

            if self.graph.all_done() {
                break RunOutcome::Completed;
            }
            if self.cost_spent >= self.config.max_cost_units {
                mlog_warn!("Cost budget exhausted: {} units spent", self.cost_spent);
                break RunOutcome::BudgetExhausted;
            }
        };

        let summary = self.summarize(outcome);
        self.save_snapshot(Some(outcome))?;
        mlog!(
            "Run finished: outcome={} rounds={} cost={} done={} blocked={}",
            outcome,
            summary.rounds,
            summary.cost_spent,
            summary.tasks_done,
            summary.tasks_blocked
        );
        Ok(summary)
    }

    fn summarize(&self, outcome: RunOutcome) -> RunSummary {
        let counts = self.graph.status_counts();
        RunSummary {
            outcome,
            rounds: self.round.min(self.config.max_rounds),
            cost_spent: self.cost_spent,
            tasks_done: counts.get(&TaskStatus::Done).copied().unwrap_or(0),
            tasks_blocked: counts.get(&TaskStatus::Blocked).copied().unwrap_or(0),
            findings: self.findings.clone(),
        }
    }

    /// Return cascade-blocked tasks to the pending pool; readiness picks
    /// them up once their dependencies are done again.
    fn requeue_cascaded(&mut self) {
        let ids: Vec<TaskId> = self.cascaded.drain().collect();
        for id in ids {
            if let Err(e) = self.graph.requeue(&id) {
                mlog_warn!("requeue of {} failed: {}", id.short(), e);
            }
        }
    }

    /// Assign every queued task the slots and budget allow. Returns the
    /// number of assignments made.
    async fn dispatch(&mut self) -> Result<usize> {
        let mut dispatched = 0;
        for id in self.graph.dispatch_queue() {
            if self.cost_spent >= self.config.max_cost_units {
                break;
            }
            let Some(task) = self.graph.get_task(&id) else {
                continue;
            };
            let role = task.role;
            if !self.scheduler.has_capacity(role).await {
                continue;
            }

            let attempt = self.attempts.entry(id).or_insert(0);
            *attempt += 1;
            let branch = format!("maestro/{}-a{}", id.short(), attempt);
            let worktree = self.worktrees_dir.join(format!("{}-a{}", id.short(), attempt));
            self.repo
                .create_worktree(&branch, &self.config.integration_branch, &worktree)?;

            if let Some(task) = self.graph.get_task_mut(&id) {
                task.set_branch(&branch);
            }

            let Some(task) = self.graph.get_task(&id).cloned() else {
                continue;
            };
            match self.scheduler.assign(&task, worktree.clone()).await {
                Ok(handle) => {
                    mlog!(
                        "Dispatched task {} ({}) as assignment {} on branch {}",
                        id.short(),
                        task.title,
                        handle.id,
                        branch
                    );
                    self.graph.mark_status(&id, TaskStatus::Assigned)?;
                    self.active.insert(id, (worktree, branch));
                    self.cost_spent += 1;
                    dispatched += 1;
                }
                Err(Error::NoAvailableSlot { .. }) => {
                    // Lost the race for the last slot; the task stays Ready
                    // and the attempt does not count.
                    self.repo.remove_worktree(&worktree)?;
                    self.repo.delete_branch(&branch)?;
                    if let Some(attempt) = self.attempts.get_mut(&id) {
                        *attempt -= 1;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(dispatched)
    }

    /// Process one assignment completion. Returns true when the task's
    /// change set landed on the integration branch.
    async fn handle_completion(&mut self, completion: AssignmentCompletion) -> Result<bool> {
        let id = completion.task;
        match completion.result {
            AssignmentResult::Completed(outcome) if outcome.success => {
                self.graph.mark_status(&id, TaskStatus::InReview)?;
                self.review_and_land(id, outcome.change_set).await
            }
            AssignmentResult::Completed(outcome) => {
                self.fail_task(id, &outcome.diagnostics)?;
                Ok(false)
            }
            AssignmentResult::TimedOut { timeout } => {
                self.fail_task(id, &format!("agent timed out after {:?}", timeout))?;
                Ok(false)
            }
            AssignmentResult::Error(detail) => {
                self.fail_task(id, &detail)?;
                Ok(false)
            }
            AssignmentResult::Cancelled => {
                self.fail_task(id, "assignment cancelled")?;
                Ok(false)
            }
        }
    }

    /// Isolated validation and, on success, the integration merge.
    ///
    /// `agent_change_set` is the opaque reference the agent reported for its
    /// work, if any; it takes precedence over the commit id derived here.
    async fn review_and_land(
        &mut self,
        id: TaskId,
        agent_change_set: Option<String>,
    ) -> Result<bool> {
        let Some((worktree, branch)) = self.active.remove(&id) else {
            mlog_error!("completion for task {} with no active worktree", id.short());
            return Ok(false);
        };

        // The agent may leave its edits uncommitted; commit them so the
        // branch carries the change set.
        if RepoOps::is_dirty(&worktree)? {
            let title = self
                .graph
                .get_task(&id)
                .map(|t| t.title.clone())
                .unwrap_or_default();
            self.repo
                .commit_all(&worktree, &format!("task {}: {}", id.short(), title))?;
        }
        let change_set = match agent_change_set {
            Some(reference) => reference,
            None => self.repo.branch_head(&branch)?,
        };
        if let Some(task) = self.graph.get_task_mut(&id) {
            task.set_change_set(&change_set);
        }

        let scope = Scope::Isolated {
            task: id,
            change_set: Some(change_set),
        };
        let report = self.pipeline.validate(scope, &worktree).await?;
        if !report.passed() {
            let summary = report.summary();
            self.active.insert(id, (worktree, branch));
            self.fail_task(id, &summary)?;
            return Ok(false);
        }

        match self.repo.merge_branch(&self.integration_worktree, &branch)? {
            MergeOutcome::Merged { commit } => {
                let subsystem = self
                    .graph
                    .get_task(&id)
                    .map(|t| t.subsystem.clone())
                    .unwrap_or_default();
                mlog!(
                    "Task {} landed on {} as {} (subsystem {})",
                    id.short(),
                    self.config.integration_branch,
                    &commit[..8.min(commit.len())],
                    subsystem
                );
                self.composition.record_isolated(&subsystem, id, report);
                self.landed.push(LandedChange {
                    task: id,
                    subsystem,
                    branch,
                });
                self.graph.mark_status(&id, TaskStatus::Done)?;
                // The branch stays for probes; the worktree is done.
                self.repo.remove_worktree(&worktree)?;
                Ok(true)
            }
            MergeOutcome::Conflicts { files } => {
                let reason = format!("merge conflict in: {}", files.join(", "));
                self.active.insert(id, (worktree, branch));
                self.fail_task(id, &reason)?;
                Ok(false)
            }
        }
    }

    /// Record a failure and either requeue the task or block it when the
    /// retry budget is spent.
    fn fail_task(&mut self, id: TaskId, reason: &str) -> Result<()> {
        let retry_budget = self.config.retry_budget;
        let retries_remaining = match self.graph.get_task_mut(&id) {
            Some(task) => {
                task.record_failure(reason);
                task.retries_remaining(retry_budget)
            }
            None => return Ok(()),
        };
        self.graph.mark_status(&id, TaskStatus::Failed)?;

        if let Some((worktree, branch)) = self.active.remove(&id) {
            self.repo.remove_worktree(&worktree)?;
            self.repo.delete_branch(&branch)?;
        }

        if retries_remaining {
            mlog_warn!("Task {} failed, will retry: {}", id.short(), reason);
            self.graph.mark_status(&id, TaskStatus::Ready)?;
        } else {
            mlog_warn!(
                "Task {} failed with retry budget spent, blocking: {}",
                id.short(),
                reason
            );
            if let Some(task) = self.graph.get_task_mut(&id) {
                task.blocked_reason = Some(format!(
                    "retry budget exhausted after {} attempts: {}",
                    task.retries, reason
                ));
            }
            self.graph.mark_status(&id, TaskStatus::Blocked)?;
        }
        Ok(())
    }

    /// Validate the integrated tree; on failure, diagnose and reopen.
    async fn run_integration_validation(&mut self) -> Result<()> {
        let subsystems = self.composition.changed_subsystems().to_vec();
        let scope = Scope::Integrated {
            subsystems: subsystems.clone(),
        };
        let report = self
            .pipeline
            .validate(scope, &self.integration_worktree)
            .await?;
        if report.passed() {
            mlog_debug!("Integration validation passed: {}", report.summary());
            return Ok(());
        }
        mlog_warn!("Integration validation failed: {}", report.summary());

        let prober = RepoProber {
            repo: &self.repo,
            pipeline: &self.pipeline,
            landed: &self.landed,
            base_commit: &self.base_commit,
            worktrees_dir: &self.worktrees_dir,
        };
        let finding = self.composition.analyze(&report, &prober).await?;

        let Some(finding) = finding else {
            // Not a composition effect; nothing to reopen. The failure is
            // attributable to the base tree or an already-failed task.
            mlog_error!(
                "Integration failure with no composition finding: {}",
                report.summary()
            );
            return Ok(());
        };

        mlog!(
            "Composition finding: subsystems=[{}] trigger={} severity={:?} probes={}",
            finding.subsystems.join(", "),
            finding.trigger,
            finding.severity,
            finding.probes_used
        );
        self.findings
            .push(FindingRecord::from_finding(&finding, self.round));

        let reason = finding.reopen_reason();
        let mut seen = HashSet::new();
        for task in &finding.implicated_tasks {
            if !seen.insert(*task) {
                continue;
            }
            // A task already cascade-blocked by an earlier reopen in this
            // loop does not need reopening itself.
            if self.graph.get_task(task).map(|t| t.status) == Some(TaskStatus::Done) {
                let cascaded = self.graph.reopen(task, &reason)?;
                self.cascaded.extend(cascaded);
            }
        }

        self.composition.reset(&finding.subsystems);
        self.landed
            .retain(|l| !finding.subsystems.contains(&l.subsystem));
        self.rebuild_integration()?;
        Ok(())
    }

    /// Recreate the integration branch from the base commit and re-land
    /// the change sets that survived the finding.
    fn rebuild_integration(&mut self) -> Result<()> {
        mlog!(
            "Rebuilding {} from base with {} retained change sets",
            self.config.integration_branch,
            self.landed.len()
        );
        self.repo.remove_worktree(&self.integration_worktree)?;
        self.repo.delete_branch(&self.config.integration_branch)?;
        self.repo.create_worktree_at(
            &self.config.integration_branch,
            &self.base_commit,
            &self.integration_worktree,
        )?;
        for landed in &self.landed {
            match self
                .repo
                .merge_branch(&self.integration_worktree, &landed.branch)?
            {
                MergeOutcome::Merged { .. } => {}
                MergeOutcome::Conflicts { files } => {
                    // These branches merged cleanly before in the same
                    // order; a conflict here means external interference.
                    mlog_error!(
                        "Retained branch {} no longer merges cleanly: {:?}",
                        landed.branch,
                        files
                    );
                    return Err(Error::MergeConflict {
                        branch: landed.branch.clone(),
                        detail: files.join(", "),
                    });
                }
            }
        }
        Ok(())
    }

    fn save_snapshot(&self, outcome: Option<RunOutcome>) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = RunSnapshot {
            goal: self.goal.clone(),
            round: self.round,
            cost_spent: self.cost_spent,
            outcome,
            tasks: self
                .graph
                .all_tasks()
                .into_iter()
                .map(|t| TaskSnapshot {
                    id: t.id,
                    title: t.title.clone(),
                    role: t.role,
                    subsystem: t.subsystem.clone(),
                    status: t.status,
                    retries: t.retries,
                    branch: t.branch.clone(),
                    change_set: t.change_set.clone(),
                    last_error: t.last_error.clone(),
                    blocked_reason: t.blocked_reason.clone(),
                    reopen_reason: t.reopen_reason.clone(),
                })
                .collect(),
            findings: self.findings.clone(),
            saved_at: Utc::now(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }
}

impl std::fmt::Debug for OrchestrationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationLoop")
            .field("goal", &self.goal)
            .field("round", &self.round)
            .field("cost_spent", &self.cost_spent)
            .finish()
    }
}

/// Probes integration prefixes by replaying landed branches from the base
/// commit in land order.
struct RepoProber<'a> {
    repo: &'a RepoOps,
    pipeline: &'a ValidationPipeline,
    landed: &'a [LandedChange],
    base_commit: &'a str,
    worktrees_dir: &'a Path,
}

#[async_trait]
impl IntegrationProber for RepoProber<'_> {
    async fn probe(&self, subsystems: &[String]) -> Result<ValidationReport> {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let branch = format!("maestro/probe-{}", &tag[..8]);
        let worktree = self.worktrees_dir.join(format!("probe-{}", &tag[..8]));
        self.repo
            .create_worktree_at(&branch, self.base_commit, &worktree)?;

        let mut conflict: Option<Vec<String>> = None;
        for landed in self
            .landed
            .iter()
            .filter(|l| subsystems.contains(&l.subsystem))
        {
            match self.repo.merge_branch(&worktree, &landed.branch)? {
                MergeOutcome::Merged { .. } => {}
                MergeOutcome::Conflicts { files } => {
                    conflict = Some(files);
                    break;
                }
            }
        }

        let scope = Scope::Integrated {
            subsystems: subsystems.to_vec(),
        };
        let report = match conflict {
            Some(files) => ValidationReport {
                scope,
                build: BuildOutcome::failed(format!(
                    "probe merge conflict in: {}",
                    files.join(", ")
                )),
                tests: Vec::new(),
            },
            None => self.pipeline.validate(scope, &worktree).await?,
        };

        self.repo.remove_worktree(&worktree)?;
        self.repo.delete_branch(&branch)?;
        Ok(report)
    }
}
