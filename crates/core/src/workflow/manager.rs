//! # Workflow Manager
//!
//! Facade over one run: stage navigation, lifecycle transitions, roadmap
//! mutations and their version history. Owns the run's `WorkflowState` and
//! writes it through on every change.
//!
//! Every change is applied to a copy of the state, saved, and only then
//! installed, so a failed save leaves the manager on the last durable state.
//! Validation failures are [`RoadmapError`]s wrapped in `anyhow::Error`.

use crate::bus::MessageBus;
use crate::error::RoadmapError;
use crate::memory::{Decision, DecisionKind, MemoryStore};
use crate::roadmap::{
    ChangeLogEntry, Roadmap, RoadmapSummary, Stage, StageGroup, StageId, StageRef, StageStatus,
};
use crate::state::{StagehandDb, WorkflowState, WorkflowStateStore};
use crate::summary::{render_stage_report, StageOutcome, StageSummary, SummaryStore};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;

/// Owner of one run's workflow state
pub struct WorkflowManager {
    states: WorkflowStateStore,
    state: WorkflowState,
    memory: MemoryStore,
    summaries: SummaryStore,
    bus: MessageBus,
}

impl WorkflowManager {
    /// Start a new run from plan steps grouped into stages
    pub fn initialize(
        db: Arc<StagehandDb>,
        run_id: &str,
        plan_steps: Vec<String>,
        grouping: Vec<StageGroup>,
        actor: &str,
    ) -> Result<Self> {
        let states = WorkflowStateStore::new(&db);
        if states.load(run_id)?.is_some() {
            anyhow::bail!("Run {} already exists; load it instead", run_id);
        }

        let roadmap = Roadmap::create(run_id, plan_steps, grouping, actor)?;
        let state = WorkflowState::new(roadmap);
        states.save(&state).context("Failed to persist new run")?;

        tracing::info!(
            run_id = %run_id,
            stages = state.roadmap.len(),
            "Workflow initialized"
        );
        Ok(Self::assemble(db, states, state))
    }

    /// Resume a saved run
    pub fn load(db: Arc<StagehandDb>, run_id: &str) -> Result<Self> {
        let states = WorkflowStateStore::new(&db);
        let state = states
            .load(run_id)?
            .with_context(|| format!("No workflow state for run {}", run_id))?;
        tracing::info!(
            run_id = %run_id,
            version = state.roadmap.version,
            active = ?state.active_stage_id,
            "Workflow loaded"
        );
        Ok(Self::assemble(db, states, state))
    }

    fn assemble(db: Arc<StagehandDb>, states: WorkflowStateStore, state: WorkflowState) -> Self {
        let run_id = state.run_id.clone();
        Self {
            states,
            memory: MemoryStore::new(db.clone(), &run_id),
            summaries: SummaryStore::new(db.clone(), &run_id),
            bus: MessageBus::new(&db, &run_id),
            state,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn roadmap(&self) -> &Roadmap {
        &self.state.roadmap
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn summaries(&self) -> &SummaryStore {
        &self.summaries
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    pub fn get_active_stage(&self) -> Option<&Stage> {
        self.state
            .active_stage_id
            .as_deref()
            .and_then(|id| self.state.roadmap.get(id))
    }

    /// First stage in roadmap order that is pending or reopened
    pub fn get_next_pending_stage(&self) -> Option<&Stage> {
        self.state.roadmap.next_runnable()
    }

    /// Live stage by id
    pub fn stage(&self, id: &str) -> Result<&Stage> {
        match self.state.roadmap.resolve(id) {
            Some(StageRef::Live(stage)) => Ok(stage),
            Some(StageRef::Retired(_)) => Err(RoadmapError::RetiredStage(id.to_string()).into()),
            None => Err(RoadmapError::UnknownStage(id.to_string()).into()),
        }
    }

    /// Most recently completed live stage positioned before `id`
    pub fn last_completed_before(&self, id: &str) -> Option<&Stage> {
        self.state
            .roadmap
            .stages_before(id)
            .into_iter()
            .filter(|s| s.status == StageStatus::Completed)
            .max_by_key(|s| s.completed_at)
    }

    // =========================================================================
    // Lifecycle (no new roadmap version)
    // =========================================================================

    /// Make a pending or reopened stage the active one
    pub fn start_stage(&mut self, id: &str) -> Result<Stage> {
        let stage = self.stage(id)?.clone();
        if let Some(active) = &self.state.active_stage_id {
            if active == id {
                return Ok(stage);
            }
            return Err(RoadmapError::AnotherStageActive {
                active: active.clone(),
                requested: id.to_string(),
            }
            .into());
        }
        if !stage.status.is_runnable() {
            return Err(RoadmapError::NotMutable {
                id: id.to_string(),
                status: stage.status,
                operation: "started",
            }
            .into());
        }

        self.memory.get_or_create(id, &stage.name)?;
        self.memory.set_final_status(id, None)?;
        self.summaries.get_or_create(id, &stage.name)?;
        self.summaries.activate(id)?;

        let mut next = self.state.clone();
        let started = {
            let stage = next.roadmap.stage_mut(id)?;
            stage.status = StageStatus::Active;
            stage.started_at = Some(Utc::now());
            stage.touch();
            stage.clone()
        };
        next.active_stage_id = Some(id.to_string());
        self.commit(next)?;

        tracing::info!(stage_id = %id, stage = %started.name, "Stage started");
        Ok(started)
    }

    /// Store the active stage's audit count once its cycle is recorded
    pub fn record_audit(&mut self, id: &str, audit_count: u32) -> Result<()> {
        self.require_active(id, "audited")?;
        let mut next = self.state.clone();
        {
            let stage = next.roadmap.stage_mut(id)?;
            stage.audit_count = audit_count;
            stage.touch();
        }
        self.commit(next)
    }

    /// Finish the active stage with `outcome`
    pub fn complete_stage(&mut self, id: &str, outcome: StageOutcome, reason: &str) -> Result<()> {
        self.require_active(id, "completed")?;

        let mut next = self.state.clone();
        {
            let stage = next.roadmap.stage_mut(id)?;
            stage.status = StageStatus::Completed;
            stage.completed_at = Some(Utc::now());
            stage.touch();
        }
        next.active_stage_id = None;
        self.commit(next)?;

        self.summaries.finalize(id, outcome)?;
        self.memory.set_final_status(id, Some(outcome))?;
        self.memory.set_summary(id, reason)?;

        tracing::info!(stage_id = %id, outcome = %outcome, reason = %reason, "Stage completed");
        Ok(())
    }

    /// Return the active stage to pending because an earlier stage was reopened
    pub fn defer_stage(&mut self, id: &str, reason: &str) -> Result<()> {
        self.require_active(id, "deferred")?;

        let mut next = self.state.clone();
        {
            let stage = next.roadmap.stage_mut(id)?;
            stage.status = StageStatus::Pending;
            // the next activation gets a fresh audit budget
            stage.audit_count = 0;
            stage.touch();
        }
        next.active_stage_id = None;
        self.commit(next)?;

        self.summaries.finalize(id, StageOutcome::RegressionDeferred)?;
        self.memory
            .set_final_status(id, Some(StageOutcome::RegressionDeferred))?;
        self.memory.add_decision(
            id,
            Decision::new("orchestrator", DecisionKind::Roadmap, reason),
        )?;

        tracing::info!(stage_id = %id, reason = %reason, "Stage deferred");
        Ok(())
    }

    pub fn set_aborted(&mut self, aborted: bool) -> Result<()> {
        let mut next = self.state.clone();
        next.aborted = aborted;
        next.updated_at = Utc::now();
        self.commit(next)
    }

    // =========================================================================
    // Roadmap mutations (each produces version + 1)
    // =========================================================================

    /// Skip a pending or active stage; returns the new version
    pub fn skip_stage(&mut self, id: &str, reason: &str, actor: &str) -> Result<u32> {
        let roadmap = self.state.roadmap.skip(id, reason, actor)?;
        let mut next = self.state.clone();
        if next.active_stage_id.as_deref() == Some(id) {
            next.active_stage_id = None;
        }
        let version = self.commit_version(next, roadmap)?;

        if self.summaries.load(id)?.is_some() {
            self.summaries.finalize(id, StageOutcome::Skipped)?;
        }
        if self.memory.load(id)?.is_some() {
            self.memory.set_final_status(id, Some(StageOutcome::Skipped))?;
        }
        Ok(version)
    }

    /// Send a completed stage back for rework; the only way back from completed
    pub fn reopen_stage(
        &mut self,
        id: &str,
        reason: &str,
        regression_source_id: Option<&str>,
        actor: &str,
    ) -> Result<u32> {
        let roadmap = self
            .state
            .roadmap
            .reopen(id, regression_source_id, reason, actor)?;
        let name = roadmap.get(id).map(|s| s.name.clone()).unwrap_or_default();
        let version = self.commit_version(self.state.clone(), roadmap)?;

        self.memory.get_or_create(id, &name)?;
        self.memory.set_final_status(id, None)?;
        self.memory.add_decision(
            id,
            Decision::new(actor, DecisionKind::Roadmap, format!("Reopened: {}", reason)),
        )?;

        tracing::info!(
            stage_id = %id,
            source = ?regression_source_id,
            version,
            "Stage reopened"
        );
        Ok(version)
    }

    /// Merge stages; returns the merged stage's id
    pub fn merge_stages(
        &mut self,
        ids: &[StageId],
        name: &str,
        reason: &str,
        actor: &str,
    ) -> Result<StageId> {
        let roadmap = self.state.roadmap.merge(ids, name, reason, actor)?;
        let merged_id = roadmap
            .change_log()
            .last()
            .and_then(|entry| entry.stage_ids.last().cloned())
            .context("Merge did not record its result")?;

        let mut next = self.state.clone();
        if let Some(active) = &next.active_stage_id {
            if ids.contains(active) {
                next.active_stage_id = Some(merged_id.clone());
            }
        }
        self.commit_version(next, roadmap)?;
        self.carry_over(ids, std::slice::from_ref(&merged_id))?;
        Ok(merged_id)
    }

    /// Split a stage; returns the new ids in order
    pub fn split_stage(
        &mut self,
        id: &str,
        parts: &[StageGroup],
        reason: &str,
        actor: &str,
    ) -> Result<Vec<StageId>> {
        let roadmap = self.state.roadmap.split(id, parts, reason, actor)?;
        let new_ids: Vec<StageId> = roadmap
            .change_log()
            .last()
            .map(|entry| entry.stage_ids.iter().skip(1).cloned().collect())
            .unwrap_or_default();

        let mut next = self.state.clone();
        if next.active_stage_id.as_deref() == Some(id) {
            next.active_stage_id = new_ids.first().cloned();
        }
        self.commit_version(next, roadmap)?;
        self.carry_over(&[id.to_string()], &new_ids)?;
        Ok(new_ids)
    }

    /// Reorder live stages; returns the new version
    pub fn reorder_stages(&mut self, order: &[StageId], reason: &str, actor: &str) -> Result<u32> {
        let roadmap = self.state.roadmap.reorder(order, reason, actor)?;
        self.commit_version(self.state.clone(), roadmap)
    }

    // =========================================================================
    // Read APIs
    // =========================================================================

    pub fn get_roadmap_summary(&self) -> RoadmapSummary {
        RoadmapSummary::from_roadmap(&self.state.roadmap)
    }

    /// Execution record of a live or retired stage
    pub fn get_stage_summary(&self, id: &str) -> Result<StageSummary> {
        let stage_ref = self
            .state
            .roadmap
            .resolve(id)
            .ok_or_else(|| RoadmapError::UnknownStage(id.to_string()))?;

        let mut summary = match self.summaries.load(id)? {
            Some(summary) => summary,
            None => StageSummary::new(id, &stage_ref.stage().name),
        };
        if let StageRef::Retired(retired) = stage_ref {
            if summary.superseded_by.is_empty() {
                summary.superseded_by = retired.successors.clone();
            }
        }
        Ok(summary)
    }

    /// Markdown report of a live or retired stage
    pub fn generate_stage_report(&self, id: &str) -> Result<String> {
        let stage = self
            .state
            .roadmap
            .resolve(id)
            .ok_or_else(|| RoadmapError::UnknownStage(id.to_string()))?
            .stage()
            .clone();
        let summary = self.get_stage_summary(id)?;
        let memory = self.memory.load(id)?;
        Ok(render_stage_report(&stage, &summary, memory.as_ref()))
    }

    /// Every roadmap version, oldest first
    pub fn history(&self) -> &[Roadmap] {
        &self.state.history
    }

    pub fn change_log(&self) -> &[ChangeLogEntry] {
        self.state.roadmap.change_log()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn require_active(&self, id: &str, operation: &'static str) -> Result<()> {
        let stage = self.stage(id)?;
        if stage.status != StageStatus::Active {
            return Err(RoadmapError::NotMutable {
                id: id.to_string(),
                status: stage.status,
                operation,
            }
            .into());
        }
        Ok(())
    }

    fn commit(&mut self, mut next: WorkflowState) -> Result<()> {
        next.updated_at = Utc::now();
        self.states
            .save(&next)
            .with_context(|| format!("Failed to persist workflow state for run {}", next.run_id))?;
        self.state = next;
        Ok(())
    }

    fn commit_version(&mut self, mut next: WorkflowState, roadmap: Roadmap) -> Result<u32> {
        let version = roadmap.version;
        if let Some(entry) = roadmap.change_log().last() {
            tracing::info!(
                run_id = %roadmap.run_id,
                version,
                mutation = %entry.mutation,
                actor = %entry.actor,
                reason = %entry.reason,
                "Roadmap changed"
            );
        }
        next.push_version(roadmap);
        self.commit(next)?;
        Ok(version)
    }

    /// Point retired stages' records at their successors and seed the
    /// successors' memory with what the retired stages left open
    fn carry_over(&self, retired: &[StageId], successors: &[StageId]) -> Result<()> {
        for old in retired {
            if self.summaries.load(old)?.is_some() {
                self.summaries.mark_superseded(old, successors)?;
            }
            let Some(memory) = self.memory.load(old)? else {
                continue;
            };
            for new_id in successors {
                let name = self
                    .state
                    .roadmap
                    .get(new_id)
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                self.memory.get_or_create(new_id, &name)?;
                for finding in memory.unresolved_findings() {
                    self.memory.add_finding(new_id, finding)?;
                }
                for decision in &memory.decisions {
                    self.memory.add_decision(new_id, decision.clone())?;
                }
            }
        }
        Ok(())
    }
}
