//! Collaborator seam: the external processes the engine drives.
//!
//! Agents, build runners, and test runners are trait objects so the engine
//! never knows whether it is talking to a real subprocess or a test stub.
//! Version control is concrete (git2) since every deployment uses git.

pub mod git;
pub mod process;

use crate::core::task::Task;
use crate::error::Result;
use crate::validation::report::{BuildOutcome, TestOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub use git::{MergeOutcome, RepoOps};
pub use process::{ProcessAgent, ProcessBuildRunner, ProcessTestRunner};

/// What an agent produced for a task.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Whether the agent believes it completed the task.
    pub success: bool,
    /// Reference to the produced change set (commit id), if any.
    pub change_set: Option<String>,
    /// Agent output, kept for failure reports and logs.
    pub diagnostics: String,
}

impl AgentOutcome {
    pub fn success(change_set: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self {
            success: true,
            change_set: Some(change_set.into()),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn failure(diagnostics: impl Into<String>) -> Self {
        Self {
            success: false,
            change_set: None,
            diagnostics: diagnostics.into(),
        }
    }
}

/// An autonomous worker that turns a task description into code changes.
///
/// `run` executes in `workdir` (a branch checkout dedicated to the task).
/// Changes may be left uncommitted; the engine commits the worktree before
/// review. Implementations must be cancel-safe: the scheduler drops the
/// future on timeout.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, task: &Task, workdir: &Path) -> Result<AgentOutcome>;
}

/// Compiles the tree and reports success or the failure excerpt.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn build(&self, workdir: &Path) -> Result<BuildOutcome>;
}

/// Runs the test suite and reports per-test outcomes.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, workdir: &Path) -> Result<Vec<TestOutcome>>;
}

/// Agents keyed by role. The scheduler looks up the runner for a task's
/// role at assignment time.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<crate::core::task::Role, Arc<dyn AgentRunner>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    pub fn register(&mut self, role: crate::core::task::Role, agent: Arc<dyn AgentRunner>) {
        self.agents.insert(role, agent);
    }

    pub fn get(&self, role: crate::core::task::Role) -> Option<Arc<dyn AgentRunner>> {
        self.agents.get(&role).cloned()
    }

    pub fn roles(&self) -> Vec<crate::core::task::Role> {
        self.agents.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}
