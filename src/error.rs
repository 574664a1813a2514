use thiserror::Error;

use crate::core::task::{Role, TaskId, TaskStatus};

/// Errors raised by TaskGraph mutations.
///
/// These are always plan or programming defects: fatal to the call that
/// issued the mutation, never to the run as a whole.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("adding dependency from {from} to {to} would create a cycle")]
    CycleDetected { from: TaskId, to: TaskId },

    #[error("unknown dependency: {0}")]
    UnknownDependency(TaskId),

    #[error("invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("no available slot for role {role}")]
    NoAvailableSlot { role: Role },

    #[error("no agent registered for role {role}")]
    NoAgentForRole { role: Role },

    #[error("merge conflict on branch {branch}: {detail}")]
    MergeConflict { branch: String, detail: String },

    #[error("collaborator failed: {0}")]
    Collaborator(String),

    #[error("no home directory")]
    NoHomeDir,

    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

pub type Result<T> = std::result::Result<T, Error>;
