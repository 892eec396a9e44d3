//! # Agent Interfaces
//!
//! The builder, reviewer and planner are external collaborators. The core
//! hands them a [`StageContext`] and only inspects the structured data they
//! return: paths and diff stats from the builder, findings from the reviewer,
//! roadmap commands from the planner.

use crate::bus::Message;
use crate::memory::{Clarification, Decision, Finding, PreviousStageContext};
use crate::roadmap::{Roadmap, Stage, StageGroup, StageId};
use crate::routing::{ModelConfig, ModelRouter};
use crate::summary::FileChange;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What an agent sees of the stage it works on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageContext {
    pub run_id: String,
    pub stage: Stage,
    /// Plan step texts covered by the stage
    pub plan_steps: Vec<String>,
    /// Cycle number being run
    pub cycle: u32,
    /// Model the router picked for the builder
    #[serde(default)]
    pub model: Option<ModelConfig>,
    /// Memory of the stage completed before this one
    #[serde(default)]
    pub previous: Option<PreviousStageContext>,
    /// Clarifications that have been answered so far
    #[serde(default)]
    pub answered_clarifications: Vec<Clarification>,
}

/// Result of one build call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOutput {
    pub files_changed: Vec<FileChange>,
    #[serde(default)]
    pub notes: String,
    /// Decisions worth keeping in the stage memory
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub cost_usd: f64,
}

/// Result of one audit call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditReport {
    pub findings: Vec<Finding>,
    /// Questions the reviewer needs answered (sent to the planner)
    #[serde(default)]
    pub clarifications: Vec<String>,
    #[serde(default)]
    pub cost_usd: f64,
}

/// The planner's write surface on the roadmap
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RoadmapCommand {
    Merge {
        ids: Vec<StageId>,
        name: String,
        reason: String,
    },
    Split {
        id: StageId,
        parts: Vec<StageGroup>,
        reason: String,
    },
    Reorder {
        order: Vec<StageId>,
        reason: String,
    },
    Skip {
        id: StageId,
        reason: String,
    },
}

#[async_trait]
pub trait Builder: Send + Sync {
    /// Produce or fix the stage's output, seeded with unresolved findings
    async fn build(&self, ctx: &StageContext, unresolved: &[Finding]) -> Result<BuildOutput>;
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Audit the files the stage currently owns
    async fn audit(&self, ctx: &StageContext, current_files: &[String]) -> Result<AuditReport>;
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// React to a report or suggestion addressed to the planner
    async fn review_report(&self, message: &Message, roadmap: &Roadmap) -> Result<Vec<RoadmapCommand>>;

    /// Answer a clarification request; `None` leaves it pending
    async fn answer_clarification(&self, _message: &Message) -> Result<Option<String>> {
        Ok(None)
    }
}

/// The collaborators a run is wired to
#[derive(Clone)]
pub struct Agents {
    pub builder: Arc<dyn Builder>,
    pub reviewer: Arc<dyn Reviewer>,
    pub planner: Option<Arc<dyn Planner>>,
    pub router: Arc<dyn ModelRouter>,
}

impl Agents {
    pub fn new(
        builder: Arc<dyn Builder>,
        reviewer: Arc<dyn Reviewer>,
        router: Arc<dyn ModelRouter>,
    ) -> Self {
        Self {
            builder,
            reviewer,
            planner: None,
            router,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }
}
