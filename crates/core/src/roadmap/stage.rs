//! # Stage
//!
//! A named unit of work in the roadmap, built and reviewed as a whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable stage identifier (`stage-N`). Never reused within a roadmap.
pub type StageId = String;

/// Lifecycle status of a stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting to be started
    #[default]
    Pending,
    /// Currently being built and audited
    Active,
    /// Finished (cleanly or with caveats)
    Completed,
    /// Completed earlier, sent back for a regression fix
    Reopened,
    /// Dropped from the run without executing
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Reopened => "reopened",
            Self::Skipped => "skipped",
        }
    }

    /// Only pending and active stages accept structural mutations.
    pub fn is_mutable(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    /// Stages waiting for their turn to run.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Pending | Self::Reopened)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage of the roadmap
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    /// Stable identifier
    pub id: StageId,
    /// Human-readable name
    pub name: String,
    /// Ordinal position in the roadmap (0-based)
    pub position: usize,
    /// Lifecycle status
    pub status: StageStatus,
    /// Indices of the atomic plan steps this stage covers
    pub plan_steps: Vec<usize>,
    /// Audits performed since the stage was last (re)opened
    pub audit_count: u32,
    /// Number of times this stage was reopened
    #[serde(default)]
    pub reopen_count: u32,
    /// Stage whose findings caused the latest reopen
    #[serde(default)]
    pub regression_source_id: Option<StageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Stage {
    pub(crate) fn new(id: StageId, name: &str, position: usize, plan_steps: Vec<usize>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.to_string(),
            position,
            status: StageStatus::Pending,
            plan_steps,
            audit_count: 0,
            reopen_count: 0,
            regression_source_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A stage removed from the live order by a merge or split.
///
/// Kept so old ids stay resolvable for provenance lookups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetiredStage {
    /// The stage record as it was when retired
    pub stage: Stage,
    /// Ids that replaced it
    pub successors: Vec<StageId>,
    /// Roadmap version that retired it
    pub retired_in_version: u32,
}
