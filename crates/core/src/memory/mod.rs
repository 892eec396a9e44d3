//! # Memory Module
//!
//! Per-stage knowledge ledger feeding regression detection and the next
//! stage's context.
//!
//! ```text
//! Decisions + Findings + Clarifications
//!                ↓
//!           StageMemory  ──previous_stage_id──▶ StageMemory
//!                ↓
//!     MemoryStore (write-through, SQLite)
//! ```

pub mod stage_memory;
pub mod store;

pub use stage_memory::{
    Clarification, Decision, DecisionKind, Finding, PreviousStageContext, Severity, StageMemory,
};
pub use store::MemoryStore;
