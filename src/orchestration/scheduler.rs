//! Agent scheduler: turns ready tasks into supervised assignments.
//!
//! Each assignment occupies one slot and runs the role's agent under a
//! per-role timeout in a spawned task. Completions are multiplexed onto a
//! single channel so the engine awaits all in-flight assignments
//! collectively instead of polling handles. Slots are released on every
//! exit path, including timeout and cancellation.

use crate::collab::{AgentOutcome, AgentRegistry};
use crate::core::task::{Role, Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::slots::{SlotId, SlotPool};
use crate::{mlog_debug, mlog_warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capacity of the completion channel; bounded so a wedged engine applies
/// backpressure instead of growing without limit.
const COMPLETION_CHANNEL_SIZE: usize = 256;

/// How an assignment ended.
#[derive(Debug, Clone)]
pub enum AssignmentResult {
    /// The agent ran to completion (it may still report failure).
    Completed(AgentOutcome),
    /// The agent exceeded its role's timeout and was abandoned.
    TimedOut { timeout: Duration },
    /// The agent returned an engine-level error.
    Error(String),
    /// The run was cancelled while the agent was in flight.
    Cancelled,
}

/// Delivered on the completion channel for every assignment, exactly once.
#[derive(Debug)]
pub struct AssignmentCompletion {
    pub assignment_id: Uuid,
    pub task: TaskId,
    pub role: Role,
    pub slot: SlotId,
    pub result: AssignmentResult,
}

/// Returned by `assign`; identifies the in-flight assignment.
#[derive(Debug, Clone)]
pub struct AssignmentHandle {
    pub id: Uuid,
    pub task: TaskId,
    pub slot: SlotId,
}

pub struct AgentScheduler {
    pool: Arc<RwLock<SlotPool>>,
    agents: AgentRegistry,
    timeouts: HashMap<Role, Duration>,
    default_timeout: Duration,
    completion_tx: mpsc::Sender<AssignmentCompletion>,
    completion_rx: mpsc::Receiver<AssignmentCompletion>,
    cancel: CancellationToken,
    in_flight: usize,
}

impl AgentScheduler {
    pub fn new(pool: SlotPool, agents: AgentRegistry, default_timeout: Duration) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_SIZE);
        Self {
            pool: Arc::new(RwLock::new(pool)),
            agents,
            timeouts: HashMap::new(),
            default_timeout,
            completion_tx,
            completion_rx,
            cancel: CancellationToken::new(),
            in_flight: 0,
        }
    }

    /// Override the timeout for one role.
    pub fn set_role_timeout(&mut self, role: Role, timeout: Duration) {
        self.timeouts.insert(role, timeout);
    }

    fn timeout_for(&self, role: Role) -> Duration {
        self.timeouts
            .get(&role)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Assignments currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub async fn has_capacity(&self, role: Role) -> bool {
        self.pool.read().await.has_capacity(role)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abandon all in-flight assignments. Each one still delivers a
    /// `Cancelled` completion and frees its slot.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Assign a task to an agent of its role.
    ///
    /// Acquires a slot, spawns the supervised agent run, and returns
    /// immediately. The outcome arrives later via `next_completion`.
    ///
    /// # Errors
    /// - `Error::NoAgentForRole` when no agent is registered for the role
    /// - `Error::NoAvailableSlot` when the role's slots are all busy
    pub async fn assign(&mut self, task: &Task, workdir: PathBuf) -> Result<AssignmentHandle> {
        let role = task.role;
        let agent = self
            .agents
            .get(role)
            .ok_or(Error::NoAgentForRole { role })?;
        let slot = self.pool.write().await.acquire(role, task.id)?;

        let assignment_id = Uuid::new_v4();
        let timeout = self.timeout_for(role);
        let task_id = task.id;
        let task = task.clone();
        let pool = self.pool.clone();
        let tx = self.completion_tx.clone();
        let cancel = self.cancel.clone();

        mlog_debug!(
            "assign task={} role={} slot={} timeout={:?}",
            task_id.short(),
            role,
            slot.short(),
            timeout
        );

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => AssignmentResult::Cancelled,
                run = tokio::time::timeout(timeout, agent.run(&task, &workdir)) => {
                    match run {
                        Ok(Ok(outcome)) => AssignmentResult::Completed(outcome),
                        Ok(Err(e)) => AssignmentResult::Error(e.to_string()),
                        Err(_) => AssignmentResult::TimedOut { timeout },
                    }
                }
            };

            {
                let mut pool = pool.write().await;
                pool.release(slot);
                match &result {
                    AssignmentResult::Completed(outcome) if outcome.success => {
                        pool.record_success(slot)
                    }
                    AssignmentResult::Cancelled => {}
                    _ => pool.record_failure(slot),
                }
            }

            if tx
                .send(AssignmentCompletion {
                    assignment_id,
                    task: task_id,
                    role,
                    slot,
                    result,
                })
                .await
                .is_err()
            {
                mlog_warn!(
                    "completion channel closed before task {} reported",
                    task_id.short()
                );
            }
        });

        self.in_flight += 1;
        Ok(AssignmentHandle {
            id: assignment_id,
            task: task_id,
            slot,
        })
    }

    /// Await the next assignment completion, in whatever order agents
    /// finish. Returns `None` when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<AssignmentCompletion> {
        if self.in_flight == 0 {
            return None;
        }
        let completion = self.completion_rx.recv().await;
        if completion.is_some() {
            self.in_flight -= 1;
        }
        completion
    }
}

impl std::fmt::Debug for AgentScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentScheduler")
            .field("in_flight", &self.in_flight)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
