//! Role-partitioned agent slots.
//!
//! A slot is a unit of agent capacity for one role. The pool enforces the
//! per-role ceiling: `acquire` fails when every slot for the role is busy,
//! and the scheduler releases the slot when the assignment finishes, times
//! out, or is cancelled. Release is idempotent so reclaim paths can race.

use crate::core::task::{Role, TaskId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an agent slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(pub Uuid);

impl SlotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form for logs (first 8 hex chars).
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of agent capacity.
#[derive(Debug, Clone)]
pub struct AgentSlot {
    pub id: SlotId,
    pub role: Role,
    /// The task currently occupying the slot, if any.
    pub busy_with: Option<TaskId>,
    /// Failures since the last success, for health reporting.
    pub consecutive_failures: u32,
    /// Total assignments served over the run.
    pub assignments: u64,
}

impl AgentSlot {
    fn new(role: Role) -> Self {
        Self {
            id: SlotId::new(),
            role,
            busy_with: None,
            consecutive_failures: 0,
            assignments: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy_with.is_some()
    }
}

/// Fixed pool of agent slots, partitioned by role.
#[derive(Debug, Default)]
pub struct SlotPool {
    slots: HashMap<Role, Vec<AgentSlot>>,
}

impl SlotPool {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Add `count` slots for a role. Called once per role at startup.
    pub fn add_slots(&mut self, role: Role, count: usize) {
        let slots = self.slots.entry(role).or_default();
        for _ in 0..count {
            slots.push(AgentSlot::new(role));
        }
    }

    /// Acquire a free slot for a role and bind it to a task.
    ///
    /// # Errors
    /// Returns `Error::NoAvailableSlot` when every slot for the role is
    /// busy (or the role has no slots at all).
    pub fn acquire(&mut self, role: Role, task: TaskId) -> Result<SlotId> {
        let slots = self
            .slots
            .get_mut(&role)
            .ok_or(Error::NoAvailableSlot { role })?;
        let slot = slots
            .iter_mut()
            .find(|s| !s.is_busy())
            .ok_or(Error::NoAvailableSlot { role })?;
        slot.busy_with = Some(task);
        slot.assignments += 1;
        Ok(slot.id)
    }

    /// Free a slot. Idempotent: releasing a free or unknown slot is a
    /// no-op. Returns true if the slot was busy.
    pub fn release(&mut self, slot_id: SlotId) -> bool {
        for slots in self.slots.values_mut() {
            if let Some(slot) = slots.iter_mut().find(|s| s.id == slot_id) {
                let was_busy = slot.busy_with.take().is_some();
                return was_busy;
            }
        }
        false
    }

    pub fn record_success(&mut self, slot_id: SlotId) {
        if let Some(slot) = self.slot_mut(slot_id) {
            slot.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&mut self, slot_id: SlotId) {
        if let Some(slot) = self.slot_mut(slot_id) {
            slot.consecutive_failures += 1;
        }
    }

    fn slot_mut(&mut self, slot_id: SlotId) -> Option<&mut AgentSlot> {
        self.slots
            .values_mut()
            .flat_map(|v| v.iter_mut())
            .find(|s| s.id == slot_id)
    }

    pub fn get(&self, slot_id: SlotId) -> Option<&AgentSlot> {
        self.slots
            .values()
            .flat_map(|v| v.iter())
            .find(|s| s.id == slot_id)
    }

    /// Free slots for a role.
    pub fn available(&self, role: Role) -> usize {
        self.slots
            .get(&role)
            .map(|v| v.iter().filter(|s| !s.is_busy()).count())
            .unwrap_or(0)
    }

    /// Total slots for a role.
    pub fn capacity(&self, role: Role) -> usize {
        self.slots.get(&role).map(|v| v.len()).unwrap_or(0)
    }

    pub fn has_capacity(&self, role: Role) -> bool {
        self.available(role) > 0
    }

    /// Busy slots across all roles.
    pub fn busy_count(&self) -> usize {
        self.slots
            .values()
            .flat_map(|v| v.iter())
            .filter(|s| s.is_busy())
            .count()
    }
}
