//! # Stage Summaries
//!
//! Authoritative per-stage execution records and their report rendering.

pub mod report;
pub mod stage_summary;
pub mod store;

pub use report::render_stage_report;
pub use stage_summary::{
    normalize_path, ChangeType, CycleStatus, FileChange, FileChangeRecord, FixCycle, Issue,
    IssueDelta, StageOutcome, StageSummary,
};
pub use store::SummaryStore;
