//! # Roadmap
//!
//! Versioned, ordered collection of stages for one run.
//!
//! Stage records live in an id-keyed map and the roadmap order is a separate
//! id list, so merges and splits never shift indices out from under callers.
//! Every structural mutation returns a new `Roadmap` at `version + 1`; the
//! receiver is left untouched and the caller keeps it as history.

use super::stage::{RetiredStage, Stage, StageId, StageStatus};
use crate::error::{RoadmapError, RoadmapResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// A named group of plan steps that becomes one stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageGroup {
    pub name: String,
    pub plan_steps: Vec<usize>,
}

impl StageGroup {
    pub fn new(name: impl Into<String>, plan_steps: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            plan_steps,
        }
    }
}

/// Kind of roadmap change recorded in the change log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Merge,
    Split,
    Reorder,
    Skip,
    Reopen,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Merge => "merge",
            Self::Split => "split",
            Self::Reorder => "reorder",
            Self::Skip => "skip",
            Self::Reopen => "reopen",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only change log entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeLogEntry {
    /// Version produced by this change
    pub version: u32,
    pub mutation: MutationKind,
    /// Who requested the change (agent role or "orchestrator")
    pub actor: String,
    /// Human-readable justification
    pub reason: String,
    /// Stages the change touched (inputs and outputs)
    pub stage_ids: Vec<StageId>,
    pub timestamp: DateTime<Utc>,
}

/// Lookup result that covers retired ids as well as live ones
#[derive(Debug, Clone, Copy)]
pub enum StageRef<'a> {
    Live(&'a Stage),
    Retired(&'a RetiredStage),
}

impl<'a> StageRef<'a> {
    pub fn stage(&self) -> &'a Stage {
        match self {
            StageRef::Live(stage) => stage,
            StageRef::Retired(retired) => &retired.stage,
        }
    }

    pub fn is_retired(&self) -> bool {
        matches!(self, StageRef::Retired(_))
    }
}

/// The versioned roadmap
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Roadmap {
    /// Run this roadmap belongs to
    pub run_id: String,
    /// Monotonically increasing version
    pub version: u32,
    /// Atomic plan steps the stages were grouped from
    pub plan_steps: Vec<String>,
    stages: BTreeMap<StageId, Stage>,
    order: Vec<StageId>,
    #[serde(default)]
    retired: BTreeMap<StageId, RetiredStage>,
    next_seq: u64,
    change_log: Vec<ChangeLogEntry>,
}

impl Roadmap {
    /// Build version 1 from plan steps grouped into stages.
    ///
    /// An empty grouping yields one stage per plan step.
    pub fn create(
        run_id: &str,
        plan_steps: Vec<String>,
        grouping: Vec<StageGroup>,
        actor: &str,
    ) -> RoadmapResult<Self> {
        let grouping = if grouping.is_empty() {
            plan_steps
                .iter()
                .enumerate()
                .map(|(i, step)| StageGroup::new(step.clone(), vec![i]))
                .collect()
        } else {
            grouping
        };

        if grouping.is_empty() {
            return Err(RoadmapError::invalid("create", "roadmap needs at least one stage"));
        }

        let mut roadmap = Self {
            run_id: run_id.to_string(),
            version: 1,
            plan_steps,
            stages: BTreeMap::new(),
            order: Vec::new(),
            retired: BTreeMap::new(),
            next_seq: 1,
            change_log: Vec::new(),
        };

        for group in &grouping {
            if group.name.trim().is_empty() {
                return Err(RoadmapError::invalid("create", "stage names must not be empty"));
            }
            roadmap.check_plan_steps(&group.plan_steps)?;
            let id = roadmap.allocate_id();
            let position = roadmap.order.len();
            let stage = Stage::new(id.clone(), &group.name, position, sorted(&group.plan_steps));
            roadmap.stages.insert(id.clone(), stage);
            roadmap.order.push(id);
        }

        let ids = roadmap.order.clone();
        roadmap.change_log.push(ChangeLogEntry {
            version: 1,
            mutation: MutationKind::Create,
            actor: actor.to_string(),
            reason: format!("Initial roadmap with {} stages", ids.len()),
            stage_ids: ids,
            timestamp: Utc::now(),
        });

        Ok(roadmap)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Stages in roadmap order
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.order.iter().filter_map(|id| self.stages.get(id))
    }

    /// Ids in roadmap order
    pub fn order(&self) -> &[StageId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Live stage by id
    pub fn get(&self, id: &str) -> Option<&Stage> {
        self.stages.get(id)
    }

    /// Live or retired stage by id
    pub fn resolve(&self, id: &str) -> Option<StageRef<'_>> {
        if let Some(stage) = self.stages.get(id) {
            return Some(StageRef::Live(stage));
        }
        self.retired.get(id).map(StageRef::Retired)
    }

    pub fn retired(&self) -> impl Iterator<Item = &RetiredStage> {
        self.retired.values()
    }

    /// First live stage with this name, in roadmap order
    pub fn find_by_name(&self, name: &str) -> Option<&Stage> {
        self.stages().find(|s| s.name == name)
    }

    pub fn active_stage(&self) -> Option<&Stage> {
        self.stages().find(|s| s.status == StageStatus::Active)
    }

    /// First stage in roadmap order that is pending or reopened
    pub fn next_runnable(&self) -> Option<&Stage> {
        self.stages().find(|s| s.status.is_runnable())
    }

    /// Whether every live stage is completed or skipped
    pub fn is_finished(&self) -> bool {
        self.stages().all(|s| s.status.is_terminal())
    }

    pub fn change_log(&self) -> &[ChangeLogEntry] {
        &self.change_log
    }

    /// Live stages before `id` in roadmap order
    pub fn stages_before(&self, id: &str) -> Vec<&Stage> {
        self.stages().take_while(|s| s.id != id).collect()
    }

    // =========================================================================
    // Structural mutations (each returns version + 1)
    // =========================================================================

    /// Merge two or more mutable stages into one new stage.
    ///
    /// The merged stage takes the earliest constituent's position; the
    /// constituents are retired and stay resolvable.
    pub fn merge(
        &self,
        ids: &[StageId],
        name: &str,
        reason: &str,
        actor: &str,
    ) -> RoadmapResult<Roadmap> {
        if ids.len() < 2 {
            return Err(RoadmapError::invalid("merge", "at least two stages are required"));
        }
        if name.trim().is_empty() {
            return Err(RoadmapError::invalid("merge", "merged stage needs a name"));
        }
        let unique: HashSet<&StageId> = ids.iter().collect();
        if unique.len() != ids.len() {
            return Err(RoadmapError::invalid("merge", "stage ids must be distinct"));
        }

        let mut constituents = Vec::with_capacity(ids.len());
        for id in ids {
            let stage = self.live(id)?;
            if !stage.status.is_mutable() {
                return Err(RoadmapError::NotMutable {
                    id: id.clone(),
                    status: stage.status,
                    operation: "merged",
                });
            }
            constituents.push(stage);
        }

        let mut next = self.clone();
        let merged_id = next.allocate_id();
        let insert_at = constituents
            .iter()
            .map(|s| s.position)
            .min()
            .unwrap_or(0);

        let steps: BTreeSet<usize> = constituents
            .iter()
            .flat_map(|s| s.plan_steps.iter().copied())
            .collect();
        let mut merged = Stage::new(
            merged_id.clone(),
            name,
            insert_at,
            steps.into_iter().collect(),
        );
        if let Some(active) = constituents.iter().find(|s| s.status == StageStatus::Active) {
            merged.status = StageStatus::Active;
            merged.audit_count = active.audit_count;
            merged.started_at = active.started_at;
        }

        let retired_version = self.version + 1;
        for id in ids {
            next.retire(id, vec![merged_id.clone()], retired_version);
        }
        let index = insert_at.min(next.order.len());
        next.order.insert(index, merged_id.clone());
        next.stages.insert(merged_id.clone(), merged);
        next.renumber();

        let mut touched = ids.to_vec();
        touched.push(merged_id);
        Ok(next.commit(MutationKind::Merge, actor, reason, touched))
    }

    /// Split one mutable stage into two or more new stages.
    pub fn split(
        &self,
        id: &str,
        parts: &[StageGroup],
        reason: &str,
        actor: &str,
    ) -> RoadmapResult<Roadmap> {
        let original = self.live(id)?;
        if !original.status.is_mutable() {
            return Err(RoadmapError::NotMutable {
                id: id.to_string(),
                status: original.status,
                operation: "split",
            });
        }
        if parts.len() < 2 {
            return Err(RoadmapError::invalid("split", "at least two parts are required"));
        }

        let allowed: HashSet<usize> = original.plan_steps.iter().copied().collect();
        let mut seen = HashSet::new();
        for part in parts {
            if part.name.trim().is_empty() {
                return Err(RoadmapError::invalid("split", "part names must not be empty"));
            }
            for step in &part.plan_steps {
                if !allowed.contains(step) {
                    return Err(RoadmapError::invalid(
                        "split",
                        format!("plan step {} does not belong to stage '{}'", step, id),
                    ));
                }
                if !seen.insert(*step) {
                    return Err(RoadmapError::invalid(
                        "split",
                        format!("plan step {} is assigned to more than one part", step),
                    ));
                }
            }
        }

        let mut next = self.clone();
        let position = original.position;
        let was_active = original.status == StageStatus::Active;

        let mut new_ids = Vec::with_capacity(parts.len());
        for (offset, part) in parts.iter().enumerate() {
            let new_id = next.allocate_id();
            let mut stage = Stage::new(
                new_id.clone(),
                &part.name,
                position + offset,
                sorted(&part.plan_steps),
            );
            if was_active && offset == 0 {
                stage.status = StageStatus::Active;
                stage.audit_count = original.audit_count;
                stage.started_at = original.started_at;
            }
            next.stages.insert(new_id.clone(), stage);
            new_ids.push(new_id);
        }

        next.retire(id, new_ids.clone(), self.version + 1);
        for (offset, new_id) in new_ids.iter().enumerate() {
            next.order.insert(position + offset, new_id.clone());
        }
        next.renumber();

        let mut touched = vec![id.to_string()];
        touched.extend(new_ids);
        Ok(next.commit(MutationKind::Split, actor, reason, touched))
    }

    /// Reorder live stages.
    ///
    /// `order` must be a permutation of the current order, and completed or
    /// skipped stages must keep their positions.
    pub fn reorder(&self, order: &[StageId], reason: &str, actor: &str) -> RoadmapResult<Roadmap> {
        for id in order {
            self.live(id)?;
        }
        let current: HashSet<&StageId> = self.order.iter().collect();
        let proposed: HashSet<&StageId> = order.iter().collect();
        if order.len() != self.order.len() || proposed != current {
            return Err(RoadmapError::invalid(
                "reorder",
                "new order must contain every live stage exactly once",
            ));
        }

        for (index, id) in order.iter().enumerate() {
            let stage = &self.stages[id];
            if !stage.status.is_terminal() || stage.position == index {
                continue;
            }
            return Err(RoadmapError::NotMutable {
                id: id.clone(),
                status: stage.status,
                operation: "moved",
            });
        }

        let mut next = self.clone();
        next.order = order.to_vec();
        next.renumber();
        Ok(next.commit(MutationKind::Reorder, actor, reason, order.to_vec()))
    }

    /// Mark a pending or active stage as skipped.
    pub fn skip(&self, id: &str, reason: &str, actor: &str) -> RoadmapResult<Roadmap> {
        let stage = self.live(id)?;
        if !stage.status.is_mutable() {
            return Err(RoadmapError::NotMutable {
                id: id.to_string(),
                status: stage.status,
                operation: "skipped",
            });
        }

        let mut next = self.clone();
        let stage = next.stage_mut(id)?;
        stage.status = StageStatus::Skipped;
        stage.completed_at = Some(Utc::now());
        stage.touch();
        Ok(next.commit(MutationKind::Skip, actor, reason, vec![id.to_string()]))
    }

    /// Send a completed stage back for rework.
    ///
    /// Resets the audit count, sets the status to reopened and records the
    /// stage whose findings triggered it. No other stage changes.
    pub fn reopen(
        &self,
        id: &str,
        regression_source_id: Option<&str>,
        reason: &str,
        actor: &str,
    ) -> RoadmapResult<Roadmap> {
        let stage = self.live(id)?;
        if stage.status != StageStatus::Completed {
            return Err(RoadmapError::NotMutable {
                id: id.to_string(),
                status: stage.status,
                operation: "reopened",
            });
        }

        let mut next = self.clone();
        let stage = next.stage_mut(id)?;
        stage.status = StageStatus::Reopened;
        stage.audit_count = 0;
        stage.reopen_count += 1;
        stage.regression_source_id = regression_source_id.map(str::to_string);
        stage.completed_at = None;
        stage.touch();

        let mut touched = vec![id.to_string()];
        if let Some(source) = regression_source_id {
            touched.push(source.to_string());
        }
        Ok(next.commit(MutationKind::Reopen, actor, reason, touched))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Mutable access for lifecycle transitions, which do not bump the version.
    pub(crate) fn stage_mut(&mut self, id: &str) -> RoadmapResult<&mut Stage> {
        if self.retired.contains_key(id) {
            return Err(RoadmapError::RetiredStage(id.to_string()));
        }
        self.stages
            .get_mut(id)
            .ok_or_else(|| RoadmapError::UnknownStage(id.to_string()))
    }

    fn live(&self, id: &str) -> RoadmapResult<&Stage> {
        if let Some(stage) = self.stages.get(id) {
            return Ok(stage);
        }
        if self.retired.contains_key(id) {
            return Err(RoadmapError::RetiredStage(id.to_string()));
        }
        Err(RoadmapError::UnknownStage(id.to_string()))
    }

    fn allocate_id(&mut self) -> StageId {
        let id = format!("stage-{}", self.next_seq);
        self.next_seq += 1;
        id
    }

    fn retire(&mut self, id: &str, successors: Vec<StageId>, version: u32) {
        self.order.retain(|o| o != id);
        if let Some(stage) = self.stages.remove(id) {
            self.retired.insert(
                id.to_string(),
                RetiredStage {
                    stage,
                    successors,
                    retired_in_version: version,
                },
            );
        }
    }

    fn renumber(&mut self) {
        for (index, id) in self.order.iter().enumerate() {
            if let Some(stage) = self.stages.get_mut(id) {
                if stage.position != index {
                    stage.position = index;
                    stage.touch();
                }
            }
        }
    }

    fn check_plan_steps(&self, steps: &[usize]) -> RoadmapResult<()> {
        let len = self.plan_steps.len();
        match steps.iter().find(|&&i| i >= len) {
            Some(&index) => Err(RoadmapError::PlanStepOutOfRange { index, len }),
            None => Ok(()),
        }
    }

    fn commit(
        mut self,
        mutation: MutationKind,
        actor: &str,
        reason: &str,
        stage_ids: Vec<StageId>,
    ) -> Roadmap {
        self.version += 1;
        self.change_log.push(ChangeLogEntry {
            version: self.version,
            mutation,
            actor: actor.to_string(),
            reason: reason.to_string(),
            stage_ids,
            timestamp: Utc::now(),
        });
        tracing::debug!(
            run_id = %self.run_id,
            version = self.version,
            mutation = %mutation,
            actor = %actor,
            "Roadmap mutated"
        );
        self
    }
}

fn sorted(steps: &[usize]) -> Vec<usize> {
    let set: BTreeSet<usize> = steps.iter().copied().collect();
    set.into_iter().collect()
}
