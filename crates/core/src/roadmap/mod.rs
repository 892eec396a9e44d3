//! # Stage/Roadmap Model
//!
//! Pure data plus invariants: stages, the versioned roadmap and its mutations.
//!
//! ```text
//! Roadmap v1 ──merge──▶ Roadmap v2 ──reopen──▶ Roadmap v3 ...
//!   (kept in history)     (kept in history)      (current)
//! ```

pub mod model;
pub mod overview;
pub mod stage;

pub use model::{ChangeLogEntry, MutationKind, Roadmap, StageGroup, StageRef};
pub use overview::{RoadmapSummary, StageLine};
pub use stage::{RetiredStage, Stage, StageId, StageStatus};
