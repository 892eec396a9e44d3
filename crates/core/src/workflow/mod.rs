//! # Workflow Orchestration
//!
//! Drives a run's stages through the bounded audit-fix loop.
//!
//! ## Flow
//!
//! ```text
//! Coordinator → Manager.next_pending → start_stage
//!      ↓
//! AuditFixController: build → audit → record FixCycle
//!      ↓                         ↓
//! complete_stage          regression → reopen earlier stage, defer this one
//! ```

pub mod agents;
pub mod coordinator;
pub mod cycle;
pub mod events;
pub mod manager;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod testing;

pub use agents::{
    Agents, AuditReport, BuildOutput, Builder, Planner, Reviewer, RoadmapCommand, StageContext,
};
pub use coordinator::{Coordinator, RunReport, StageResult, WorkflowCommand};
pub use cycle::{decide, AuditFixController, LoopOutcome, StageRun};
pub use events::{EventSink, WorkflowEvent, WorkflowEventKind};
pub use manager::WorkflowManager;
