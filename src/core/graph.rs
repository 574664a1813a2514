//! Task dependency graph with status state machine.
//!
//! The TaskGraph is a directed acyclic graph over tasks. Edges point from a
//! dependency to the task that consumes it. Acyclicity is enforced on every
//! edge insertion, status transitions are validated against the lifecycle
//! state machine, and readiness is tracked with incrementally maintained
//! unmet-dependency counters so `ready_tasks()` never rescans dependencies.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{GraphError, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Insertion position of a task: (batch, sequence within the run).
///
/// Ready tasks are ordered by batch first, then role priority, then
/// sequence, so architecture work from the same decomposition batch is
/// assigned before the developer tasks it unblocks.
type InsertOrder = (u64, usize);

/// The task dependency graph.
///
/// Nodes are tasks, edges are dependencies (`from` must be Done before `to`
/// can become ready). Tasks are never removed mid-run; the graph is torn
/// down whole at run end.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Count of not-yet-Done dependencies per task.
    unmet: HashMap<TaskId, usize>,
    /// Insertion order per task, for ready-set ordering.
    order: HashMap<TaskId, InsertOrder>,
    /// Current insertion batch; bumped by `next_batch`.
    batch: u64,
    /// Monotonic insertion sequence.
    seq: usize,
    /// Total status transitions applied, across all tasks.
    transitions: u64,
}

impl TaskGraph {
    /// Create a new empty TaskGraph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            unmet: HashMap::new(),
            order: HashMap::new(),
            batch: 0,
            seq: 0,
            transitions: 0,
        }
    }

    /// Total number of status transitions applied so far. The scheduler uses
    /// deltas of this counter to tell progress from a stall.
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    /// Start a new insertion batch.
    ///
    /// Tasks added before the next call share a batch and are tie-broken by
    /// role priority in the ready ordering. Decomposition adds its whole
    /// plan in one batch; reopened-task replacements land in later batches.
    pub fn next_batch(&mut self) {
        self.batch += 1;
    }

    /// Add a task with its dependencies.
    ///
    /// All dependency ids must already exist in the graph. The insertion is
    /// atomic: on any error the graph is left unchanged.
    ///
    /// # Errors
    /// - `GraphError::DuplicateTask` if the task id is already present
    /// - `GraphError::UnknownDependency` if a dependency id is not present
    /// - `GraphError::CycleDetected` if the edges would create a cycle
    pub fn add_task(&mut self, task: Task, dependencies: &[TaskId]) -> Result<()> {
        if self.task_index.contains_key(&task.id) {
            return Err(GraphError::DuplicateTask(task.id).into());
        }
        for dep in dependencies {
            if !self.task_index.contains_key(dep) {
                return Err(GraphError::UnknownDependency(*dep).into());
            }
        }

        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);

        let mut added_edges = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            let dep_index = self.task_index[dep];
            let edge = self.graph.add_edge(dep_index, index, ());
            added_edges.push(edge);

            if is_cyclic_directed(&self.graph) {
                // Roll back everything added by this call. The node was the
                // last one inserted, so removing it restores prior indices.
                for e in added_edges.into_iter().rev() {
                    self.graph.remove_edge(e);
                }
                self.graph.remove_node(index);
                self.task_index.remove(&id);
                return Err(GraphError::CycleDetected { from: *dep, to: id }.into());
            }
        }

        let pending_deps = dependencies
            .iter()
            .filter(|dep| self.status_of(dep) != Some(TaskStatus::Done))
            .count();
        self.unmet.insert(id, pending_deps);
        self.order.insert(id, (self.batch, self.seq));
        self.seq += 1;

        Ok(())
    }

    /// Add a dependency edge between two existing tasks.
    ///
    /// # Errors
    /// Returns `GraphError::UnknownTask` if either end is missing, or
    /// `GraphError::CycleDetected` (graph unchanged) if the edge would
    /// create a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or(GraphError::UnknownTask(*from))?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or(GraphError::UnknownTask(*to))?;

        // Temporarily add the edge to check for cycles.
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(GraphError::CycleDetected {
                from: *from,
                to: *to,
            }
            .into());
        }

        if self.status_of(from) != Some(TaskStatus::Done) {
            *self.unmet.entry(*to).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph.node_weight_mut(index)
        } else {
            None
        }
    }

    fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.get_task(id).map(|t| t.status)
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Get all task ids that the given task depends on.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, petgraph::Direction::Incoming)
    }

    /// Get all task ids that depend on the given task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, petgraph::Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, dir: petgraph::Direction) -> Vec<TaskId> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph
                .neighbors_directed(index, dir)
                .filter_map(|n| self.graph.node_weight(n))
                .map(|t| t.id)
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Get all tasks in the graph.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// Tasks currently in the given status.
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.graph
            .node_weights()
            .filter(|t| t.status == status)
            .collect()
    }

    /// Count of tasks per status, for snapshots and progress logs.
    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.graph.node_weights() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    /// True if every task is in a terminal state (Done or Blocked).
    pub fn all_terminal(&self) -> bool {
        self.graph.node_weights().all(|t| t.is_terminal())
    }

    /// True if every task is Done.
    pub fn all_done(&self) -> bool {
        self.graph
            .node_weights()
            .all(|t| t.status == TaskStatus::Done)
    }

    // ========== Status state machine ==========

    /// Whether the lifecycle state machine allows `from -> to` via
    /// `mark_status`. Done leaves only via `reopen`; Blocked re-enters the
    /// live set only while retry budget remains (enforced by the caller).
    fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Ready)
                | (Pending, Blocked)
                | (Ready, Assigned)
                | (Ready, Blocked)
                | (Assigned, InReview)
                | (Assigned, Failed)
                | (Assigned, Blocked)
                | (InReview, Done)
                | (InReview, Failed)
                | (InReview, Blocked)
                | (Failed, Ready)
                | (Failed, Blocked)
                | (Blocked, Ready)
                | (Blocked, Pending)
        )
    }

    /// Transition a task to a new status.
    ///
    /// Validates the transition against the state machine and keeps the
    /// unmet-dependency counters of dependents current: a transition into
    /// Done decrements each dependent's counter exactly once.
    ///
    /// # Errors
    /// Returns `GraphError::UnknownTask` or `GraphError::InvalidTransition`.
    pub fn mark_status(&mut self, id: &TaskId, new_status: TaskStatus) -> Result<()> {
        let task = self.get_task_mut(id).ok_or(GraphError::UnknownTask(*id))?;
        let old_status = task.status;

        if old_status == new_status {
            return Ok(());
        }
        if !Self::transition_allowed(old_status, new_status) {
            return Err(GraphError::InvalidTransition {
                id: *id,
                from: old_status,
                to: new_status,
            }
            .into());
        }

        task.status = new_status;
        match new_status {
            TaskStatus::Assigned => task.started_at = Some(chrono::Utc::now()),
            TaskStatus::Done => task.completed_at = Some(chrono::Utc::now()),
            _ => {}
        }
        self.transitions += 1;

        if new_status == TaskStatus::Done {
            self.on_dependency_done(id);
        }
        Ok(())
    }

    /// Decrement dependents' unmet counters after `id` became Done.
    fn on_dependency_done(&mut self, id: &TaskId) {
        for dependent in self.dependents_of(id) {
            if let Some(count) = self.unmet.get_mut(&dependent) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Increment dependents' unmet counters after `id` stopped being Done.
    fn on_dependency_undone(&mut self, id: &TaskId) {
        for dependent in self.dependents_of(id) {
            if let Some(count) = self.unmet.get_mut(&dependent) {
                *count += 1;
            }
        }
    }

    // ========== Readiness ==========

    /// Tasks whose status is Pending and whose dependencies are all Done.
    ///
    /// O(tasks) per call: readiness is read off the unmet counters, which
    /// are maintained incrementally on every Done transition. The result is
    /// ordered by insertion batch, then role priority, then insertion
    /// sequence.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .graph
            .node_weights()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && self.unmet.get(&t.id).copied().unwrap_or(0) == 0
            })
            .collect();
        ready.sort_by_key(|t| self.ready_key(t));
        ready
    }

    fn ready_key(&self, task: &Task) -> (u64, u8, usize) {
        let (batch, seq) = self.order.get(&task.id).copied().unwrap_or((u64::MAX, 0));
        (batch, task.role.priority(), seq)
    }

    /// Tasks ready to be scheduled, by id, in assignment order.
    pub fn ready_task_ids(&self) -> Vec<TaskId> {
        self.ready_tasks().iter().map(|t| t.id).collect()
    }

    /// Promote every currently ready task from Pending to Ready. Returns
    /// the promoted ids in assignment order.
    pub fn promote_ready(&mut self) -> Vec<TaskId> {
        let ids = self.ready_task_ids();
        for id in &ids {
            if let Some(task) = self.get_task_mut(id) {
                task.status = TaskStatus::Ready;
            }
        }
        self.transitions += ids.len() as u64;
        ids
    }

    /// Tasks in Ready status (freshly promoted or queued for retry), in
    /// assignment order.
    pub fn dispatch_queue(&self) -> Vec<TaskId> {
        let mut queued: Vec<&Task> = self
            .graph
            .node_weights()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();
        queued.sort_by_key(|t| self.ready_key(t));
        queued.iter().map(|t| t.id).collect()
    }

    // ========== Reopen (composition feedback) ==========

    /// Reopen a Done task, cascading Blocked to downstream consumers.
    ///
    /// The task returns to Pending with `reason` recorded; every dependent
    /// that had already consumed it (progressed past Pending) is Blocked,
    /// transitively, forcing re-validation downstream once the reopened
    /// work lands again. Returns the ids of the cascade-blocked tasks.
    ///
    /// This is a controlled supersedes event: dependency edges never cycle,
    /// only status moves backward.
    ///
    /// # Errors
    /// Returns `GraphError::UnknownTask` if the task is missing, or
    /// `GraphError::InvalidTransition` if it is not Done.
    pub fn reopen(&mut self, id: &TaskId, reason: &str) -> Result<Vec<TaskId>> {
        let task = self.get_task_mut(id).ok_or(GraphError::UnknownTask(*id))?;
        if task.status != TaskStatus::Done {
            return Err(GraphError::InvalidTransition {
                id: *id,
                from: task.status,
                to: TaskStatus::Pending,
            }
            .into());
        }

        task.status = TaskStatus::Pending;
        task.reopen_reason = Some(reason.to_string());
        task.completed_at = None;
        task.change_set = None;
        self.transitions += 1;
        self.on_dependency_undone(id);

        // Cascade: walk dependents that consumed the reopened task.
        let mut cascaded = Vec::new();
        let mut stack = self.dependents_of(id);
        while let Some(dep_id) = stack.pop() {
            let dep_status = match self.status_of(&dep_id) {
                Some(s) => s,
                None => continue,
            };
            if matches!(dep_status, TaskStatus::Pending | TaskStatus::Blocked) {
                continue;
            }
            // A Done dependent stops satisfying its own dependents.
            if dep_status == TaskStatus::Done {
                self.on_dependency_undone(&dep_id);
                stack.extend(self.dependents_of(&dep_id));
            }
            if let Some(task) = self.get_task_mut(&dep_id) {
                task.status = TaskStatus::Blocked;
                task.blocked_reason =
                    Some(format!("dependency {} reopened: {}", id.short(), reason));
                task.completed_at = None;
                task.change_set = None;
                self.transitions += 1;
            }
            cascaded.push(dep_id);
        }

        Ok(cascaded)
    }

    /// Return a cascade-blocked task to Pending so it can become ready once
    /// its dependencies are Done again.
    ///
    /// # Errors
    /// Returns `GraphError::InvalidTransition` if the task is not Blocked.
    pub fn requeue(&mut self, id: &TaskId) -> Result<()> {
        let task = self.get_task_mut(id).ok_or(GraphError::UnknownTask(*id))?;
        if task.status != TaskStatus::Blocked {
            return Err(GraphError::InvalidTransition {
                id: *id,
                from: task.status,
                to: TaskStatus::Pending,
            }
            .into());
        }
        task.status = TaskStatus::Pending;
        task.blocked_reason = None;
        self.transitions += 1;
        Ok(())
    }

    // ========== Ordering ==========

    /// Tasks in topological order (dependencies first).
    ///
    /// # Errors
    /// Returns a cycle error; cannot happen since every insertion is
    /// cycle-checked, but surfaced rather than panicking.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id)
                .unwrap_or_default();
            GraphError::CycleDetected { from: id, to: id }
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .map(|t| t.id)
            .collect())
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// Build a graph from plan specs, resolving plan-local dependency names.
///
/// All tasks land in a single insertion batch so ready ordering falls back
/// to role priority, architect first.
pub fn graph_from_specs(specs: &[crate::core::task::TaskSpec]) -> Result<TaskGraph> {
    use crate::error::Error;

    let mut graph = TaskGraph::new();
    let mut by_name: HashMap<&str, TaskId> = HashMap::new();

    // Two passes: create all tasks first so forward references resolve,
    // then wire dependencies with full cycle checking.
    for spec in specs {
        if by_name.contains_key(spec.id.as_str()) {
            return Err(Error::InvalidPlan(format!("duplicate task id: {}", spec.id)));
        }
        let task = Task::new(&spec.title, &spec.description, spec.role, &spec.subsystem);
        by_name.insert(spec.id.as_str(), task.id);
        graph.add_task(task, &[])?;
    }
    for spec in specs {
        let to = by_name[spec.id.as_str()];
        for dep_name in &spec.depends_on {
            let from = *by_name.get(dep_name.as_str()).ok_or_else(|| {
                Error::InvalidPlan(format!(
                    "task {} depends on unknown task {}",
                    spec.id, dep_name
                ))
            })?;
            graph.add_dependency(&from, &to)?;
        }
    }
    Ok(graph)
}
