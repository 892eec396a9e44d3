//! # Summary Store
//!
//! Write-through persistence for stage summaries. A FixCycle is durable once
//! `record_cycle` returns, which is what lets an interrupted run resume from
//! its last completed cycle.

use super::stage_summary::{FileChange, FixCycle, IssueDelta, StageOutcome, StageSummary};
use crate::memory::Finding;
use crate::state::{StageTable, StagehandDb};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;

/// Per-run summary store
#[derive(Clone)]
pub struct SummaryStore {
    db: Arc<StagehandDb>,
    run_id: String,
}

impl SummaryStore {
    pub fn new(db: Arc<StagehandDb>, run_id: &str) -> Self {
        Self {
            db,
            run_id: run_id.to_string(),
        }
    }

    pub fn load(&self, stage_id: &str) -> Result<Option<StageSummary>> {
        self.db
            .get_stage_doc(StageTable::Summaries, &self.run_id, stage_id)
    }

    /// All summaries of the run, in creation order
    pub fn list(&self) -> Result<Vec<StageSummary>> {
        self.db.list_stage_docs(StageTable::Summaries, &self.run_id)
    }

    pub fn get_or_create(&self, stage_id: &str, stage_name: &str) -> Result<StageSummary> {
        if let Some(summary) = self.load(stage_id)? {
            return Ok(summary);
        }
        let summary = StageSummary::new(stage_id, stage_name);
        self.save(&summary)?;
        Ok(summary)
    }

    pub fn save(&self, summary: &StageSummary) -> Result<()> {
        self.db.put_stage_doc(
            StageTable::Summaries,
            &self.run_id,
            &summary.stage_id,
            summary,
        )
    }

    pub fn record_file_changes(&self, stage_id: &str, cycle: u32, changes: &[FileChange]) -> Result<()> {
        self.update(stage_id, |summary| {
            summary.push_file_changes(cycle, changes);
        })
    }

    pub fn reconcile_issues(&self, stage_id: &str, cycle: u32, findings: &[Finding]) -> Result<IssueDelta> {
        self.update(stage_id, |summary| summary.reconcile_issues(cycle, findings))
    }

    pub fn record_cycle(&self, stage_id: &str, cycle: FixCycle) -> Result<()> {
        tracing::debug!(
            stage_id = %stage_id,
            cycle = cycle.cycle_number,
            status = %cycle.status,
            "Fix cycle recorded"
        );
        self.update(stage_id, |summary| summary.push_cycle(cycle))
    }

    pub fn mark_regression(&self, stage_id: &str, target: &str) -> Result<()> {
        self.update(stage_id, |summary| {
            summary.regression_detected = true;
            summary.regression_target = Some(target.to_string());
        })
    }

    /// Record the final outcome. A reopened stage gets a fresh outcome later.
    pub fn finalize(&self, stage_id: &str, outcome: StageOutcome) -> Result<()> {
        self.update(stage_id, |summary| {
            summary.final_status = Some(outcome);
            summary.completed_at = Some(Utc::now());
        })
    }

    /// Start a new activation: clear the outcome and fence off earlier cycles
    pub fn activate(&self, stage_id: &str) -> Result<()> {
        self.update(stage_id, |summary| {
            summary.final_status = None;
            summary.completed_at = None;
            summary.activated_at_cycle = summary.cycles.len() as u32;
        })
    }

    pub fn mark_superseded(&self, stage_id: &str, successors: &[String]) -> Result<()> {
        self.update(stage_id, |summary| {
            summary.superseded_by = successors.to_vec();
        })
    }

    fn update<T>(&self, stage_id: &str, apply: impl FnOnce(&mut StageSummary) -> T) -> Result<T> {
        let mut summary = self
            .load(stage_id)?
            .with_context(|| format!("No summary for stage {} in run {}", stage_id, self.run_id))?;
        let value = apply(&mut summary);
        self.save(&summary)?;
        Ok(value)
    }
}
