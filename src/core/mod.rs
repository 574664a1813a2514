//! Core data model: tasks and the dependency graph.

pub mod graph;
pub mod task;

pub use graph::{graph_from_specs, TaskGraph};
pub use task::{Role, Task, TaskId, TaskSpec, TaskStatus};
