//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work handed to agent collaborators. Each
//! task tracks its status, role requirement, retry count, and the opaque
//! branch/change-set handles owned by the version-control collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task within a run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Role requirement of a task, matched against slot roles by the scheduler.
///
/// A role is a data tag, not a type hierarchy: the scheduler resolves it
/// against a capability-keyed registry of agent collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Architect,
    Developer,
    Tester,
    Integrator,
}

impl Role {
    /// Scheduling priority among ready tasks; lower wins a tie.
    ///
    /// Architecture decisions unblock the largest number of dependents,
    /// so the architect goes first.
    pub fn priority(&self) -> u8 {
        match self {
            Role::Architect => 0,
            Role::Developer => 1,
            Role::Tester => 2,
            Role::Integrator => 3,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Architect => write!(f, "architect"),
            Role::Developer => write!(f, "developer"),
            Role::Tester => write!(f, "tester"),
            Role::Integrator => write!(f, "integrator"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "architect" => Ok(Role::Architect),
            "developer" => Ok(Role::Developer),
            "tester" => Ok(Role::Tester),
            "integrator" => Ok(Role::Integrator),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Task status in its lifecycle.
///
/// `PENDING -> READY -> ASSIGNED -> IN_REVIEW -> {DONE | FAILED}`.
/// FAILED returns to READY while retry budget remains, else BLOCKED
/// (terminal). DONE returns to PENDING only via `TaskGraph::reopen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, dependencies not yet all done.
    Pending,
    /// All dependencies done, schedulable.
    Ready,
    /// Bound to an agent slot, work in flight.
    Assigned,
    /// Agent returned a result, validation pending.
    InReview,
    /// Accepted and merged.
    Done,
    /// Last attempt failed; retryable while budget remains.
    Failed,
    /// Retry budget exhausted or upstream reopened; terminal until operator action.
    Blocked,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::InReview => write!(f, "in_review"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

impl TaskStatus {
    /// Terminal states: Done (unless reopened) and Blocked.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Blocked)
    }
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Detailed description; opaque to the core, consumed by the agent.
    pub description: String,
    /// Role required to execute this task.
    pub role: Role,
    /// Subsystem this task contributes to; keys composition tracking.
    pub subsystem: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Number of failed attempts so far.
    pub retries: u32,
    /// Opaque branch handle owned by the version-control collaborator.
    pub branch: Option<String>,
    /// Opaque change-set reference from the last accepted agent result.
    pub change_set: Option<String>,
    /// Error message from the most recent failure.
    pub last_error: Option<String>,
    /// Why the task is blocked, when it is.
    pub blocked_reason: Option<String>,
    /// Why the task was reopened, when it was (composition finding summary).
    pub reopen_reason: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last assigned.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached Done.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new task with the given title, role and subsystem.
    ///
    /// The task starts Pending with a generated id, zero retries, and all
    /// collaborator handles unset.
    pub fn new(title: &str, description: &str, role: Role, subsystem: &str) -> Self {
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            description: description.to_string(),
            role,
            subsystem: subsystem.to_string(),
            status: TaskStatus::Pending,
            retries: 0,
            branch: None,
            change_set: None,
            last_error: None,
            blocked_reason: None,
            reopen_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Record the branch handle from the version-control collaborator.
    pub fn set_branch(&mut self, branch: &str) {
        self.branch = Some(branch.to_string());
    }

    /// Record the change-set reference from an accepted agent result.
    pub fn set_change_set(&mut self, change_set: &str) {
        self.change_set = Some(change_set.to_string());
    }

    /// Record a failure message and bump the retry count.
    pub fn record_failure(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
        self.retries += 1;
    }

    /// Whether the task still has retry budget left.
    pub fn retries_remaining(&self, budget: u32) -> bool {
        self.retries < budget
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A declarative task entry in a plan file.
///
/// Decomposition (what tasks exist and why) is external to the core; the
/// engine only consumes the resulting specs. Dependencies are named by the
/// plan-local `id` string, resolved to TaskIds when the graph is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Plan-local identifier, referenced by `depends_on` of other entries.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub role: Role,
    pub subsystem: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}
