//! Orchestration: slots, the scheduler, and the run loop.

pub mod engine;
pub mod scheduler;
pub mod slots;

pub use engine::{OrchestrationLoop, RunOutcome, RunSnapshot, RunSummary};
pub use scheduler::{AgentScheduler, AssignmentCompletion, AssignmentHandle, AssignmentResult};
pub use slots::{AgentSlot, SlotId, SlotPool};
