//! Read-only roadmap summary for dashboards and CLIs.

use super::model::Roadmap;
use super::stage::{StageId, StageStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One row of the roadmap summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageLine {
    pub id: StageId,
    pub name: String,
    pub position: usize,
    pub status: StageStatus,
    pub audit_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regression_source_id: Option<StageId>,
}

/// Snapshot of where a run stands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoadmapSummary {
    pub run_id: String,
    pub version: u32,
    pub stages: Vec<StageLine>,
    pub active_stage_id: Option<StageId>,
    pub next_pending_stage_id: Option<StageId>,
    pub completed: usize,
    pub skipped: usize,
    pub remaining: usize,
    pub retired: usize,
}

impl RoadmapSummary {
    pub fn from_roadmap(roadmap: &Roadmap) -> Self {
        let stages: Vec<StageLine> = roadmap
            .stages()
            .map(|s| StageLine {
                id: s.id.clone(),
                name: s.name.clone(),
                position: s.position,
                status: s.status,
                audit_count: s.audit_count,
                regression_source_id: s.regression_source_id.clone(),
            })
            .collect();

        let count = |status: StageStatus| stages.iter().filter(|s| s.status == status).count();
        let completed = count(StageStatus::Completed);
        let skipped = count(StageStatus::Skipped);

        Self {
            run_id: roadmap.run_id.clone(),
            version: roadmap.version,
            active_stage_id: roadmap.active_stage().map(|s| s.id.clone()),
            next_pending_stage_id: roadmap.next_runnable().map(|s| s.id.clone()),
            completed,
            skipped,
            remaining: stages.len() - completed - skipped,
            retired: roadmap.retired().count(),
            stages,
        }
    }
}

impl fmt::Display for RoadmapSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Roadmap v{} (run {})", self.version, self.run_id)?;
        for line in &self.stages {
            let marker = match line.status {
                StageStatus::Completed => "x",
                StageStatus::Active => ">",
                StageStatus::Reopened => "!",
                StageStatus::Skipped => "-",
                StageStatus::Pending => " ",
            };
            write!(
                f,
                "  [{}] {}. {} ({}, audits: {})",
                marker,
                line.position + 1,
                line.name,
                line.id,
                line.audit_count
            )?;
            if let Some(source) = &line.regression_source_id {
                write!(f, " <- regression from {}", source)?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "{} completed, {} skipped, {} remaining",
            self.completed, self.skipped, self.remaining
        )
    }
}
