//! # Memory Store
//!
//! Write-through persistence for stage memories. Every call loads the stage's
//! document, applies the change and saves it back before returning, so a
//! crash never loses an acknowledged entry.

use super::stage_memory::{
    Clarification, Decision, Finding, PreviousStageContext, StageMemory,
};
use crate::state::{StageTable, StagehandDb};
use crate::summary::StageOutcome;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;

/// Per-run memory store
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<StagehandDb>,
    run_id: String,
}

impl MemoryStore {
    pub fn new(db: Arc<StagehandDb>, run_id: &str) -> Self {
        Self {
            db,
            run_id: run_id.to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Load a stage's memory if it exists
    pub fn load(&self, stage_id: &str) -> Result<Option<StageMemory>> {
        self.db
            .get_stage_doc(StageTable::Memories, &self.run_id, stage_id)
    }

    /// All stage memories of the run, in creation order
    pub fn list(&self) -> Result<Vec<StageMemory>> {
        self.db.list_stage_docs(StageTable::Memories, &self.run_id)
    }

    /// Get a stage's memory, creating an empty one on first access
    pub fn get_or_create(&self, stage_id: &str, stage_name: &str) -> Result<StageMemory> {
        if let Some(memory) = self.load(stage_id)? {
            return Ok(memory);
        }

        let memory = StageMemory::new(stage_id, stage_name);
        self.save(&memory)?;
        tracing::debug!(run_id = %self.run_id, stage_id = %stage_id, "Stage memory created");
        Ok(memory)
    }

    pub fn add_decision(&self, stage_id: &str, decision: Decision) -> Result<()> {
        self.update(stage_id, |memory| {
            memory.decisions.push(decision);
            Ok(())
        })
    }

    /// Append a finding; returns its id within the stage
    pub fn add_finding(&self, stage_id: &str, finding: Finding) -> Result<u32> {
        self.update(stage_id, |memory| Ok(memory.push_finding(finding)))
    }

    /// Append a clarification; returns its id within the stage
    pub fn add_clarification(&self, stage_id: &str, clarification: Clarification) -> Result<u32> {
        self.update(stage_id, |memory| Ok(memory.push_clarification(clarification)))
    }

    pub fn resolve_finding(&self, stage_id: &str, finding_id: u32, note: &str) -> Result<()> {
        self.update(stage_id, |memory| {
            let finding = memory
                .findings
                .iter_mut()
                .find(|f| f.id == finding_id)
                .with_context(|| format!("Finding {} not found in stage {}", finding_id, stage_id))?;
            finding.resolved = true;
            finding.resolution_note = Some(note.to_string());
            finding.resolved_at = Some(Utc::now());
            Ok(())
        })
    }

    pub fn answer_clarification(
        &self,
        stage_id: &str,
        clarification_id: u32,
        answer: &str,
    ) -> Result<()> {
        self.update(stage_id, |memory| {
            let clarification = memory
                .clarifications
                .iter_mut()
                .find(|c| c.id == clarification_id)
                .with_context(|| {
                    format!(
                        "Clarification {} not found in stage {}",
                        clarification_id, stage_id
                    )
                })?;
            clarification.answer = Some(answer.to_string());
            clarification.answered_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Remember which bus message carries a clarification request
    pub fn attach_clarification_message(
        &self,
        stage_id: &str,
        clarification_id: u32,
        message_id: &str,
    ) -> Result<()> {
        self.update(stage_id, |memory| {
            if let Some(c) = memory
                .clarifications
                .iter_mut()
                .find(|c| c.id == clarification_id)
            {
                c.message_id = Some(message_id.to_string());
            }
            Ok(())
        })
    }

    pub fn get_unresolved_findings(&self, stage_id: &str) -> Result<Vec<Finding>> {
        Ok(self
            .load(stage_id)?
            .map(|m| m.unresolved_findings())
            .unwrap_or_default())
    }

    pub fn get_unanswered_clarifications(&self, stage_id: &str) -> Result<Vec<Clarification>> {
        Ok(self
            .load(stage_id)?
            .map(|m| m.unanswered_clarifications())
            .unwrap_or_default())
    }

    /// Chain `stage_id`'s context to `previous_stage_id`
    pub fn link_previous_stage(&self, stage_id: &str, previous_stage_id: &str) -> Result<()> {
        self.update(stage_id, |memory| {
            memory.previous_stage_id = Some(previous_stage_id.to_string());
            Ok(())
        })
    }

    /// Count one more build/audit iteration
    pub fn record_iteration(&self, stage_id: &str) -> Result<u32> {
        self.update(stage_id, |memory| {
            memory.iterations += 1;
            Ok(memory.iterations)
        })
    }

    pub fn set_summary(&self, stage_id: &str, summary: &str) -> Result<()> {
        self.update(stage_id, |memory| {
            memory.summary = summary.to_string();
            Ok(())
        })
    }

    pub fn set_final_status(&self, stage_id: &str, status: Option<StageOutcome>) -> Result<()> {
        self.update(stage_id, |memory| {
            memory.final_status = status;
            Ok(())
        })
    }

    /// Context for a stage from the memory of the stage it is linked to
    pub fn build_context_for_next_stage(
        &self,
        stage_id: &str,
    ) -> Result<Option<PreviousStageContext>> {
        let Some(memory) = self.load(stage_id)? else {
            return Ok(None);
        };
        let Some(previous_id) = memory.previous_stage_id else {
            return Ok(None);
        };
        Ok(self
            .load(&previous_id)?
            .map(|previous| PreviousStageContext::from_memory(&previous)))
    }

    fn save(&self, memory: &StageMemory) -> Result<()> {
        self.db
            .put_stage_doc(StageTable::Memories, &self.run_id, &memory.stage_id, memory)
    }

    fn update<T>(
        &self,
        stage_id: &str,
        apply: impl FnOnce(&mut StageMemory) -> Result<T>,
    ) -> Result<T> {
        let mut memory = self
            .load(stage_id)?
            .with_context(|| format!("No memory for stage {} in run {}", stage_id, self.run_id))?;
        let value = apply(&mut memory)?;
        memory.updated_at = Utc::now();
        self.save(&memory)?;
        Ok(value)
    }
}
