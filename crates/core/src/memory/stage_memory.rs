//! # Stage Memory
//!
//! Per-stage knowledge ledger: decisions, findings and clarifications.
//! Entries are append-only; resolving a finding or answering a clarification
//! mutates the entry in place and never deletes it.

use crate::roadmap::StageId;
use crate::summary::{normalize_path, StageOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a reviewer finding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of decision an agent recorded
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Architecture or design choice
    Design,
    /// Implementation detail chosen by the builder
    Implementation,
    /// Roadmap change (merge, split, reopen, ...)
    Roadmap,
    /// Stage-level verdict (auto-advance, exhaustion)
    Verdict,
    Other,
}

/// A decision made while working on a stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub agent: String,
    pub kind: DecisionKind,
    pub description: String,
    #[serde(default)]
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(agent: &str, kind: DecisionKind, description: impl Into<String>) -> Self {
        Self {
            agent: agent.to_string(),
            kind,
            description: description.into(),
            context: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// A problem reported by the reviewer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    /// Assigned by the memory store when the finding is recorded
    #[serde(default)]
    pub id: u32,
    pub severity: Severity,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Finding {
    pub fn new(severity: Severity, category: &str, description: impl Into<String>) -> Self {
        Self {
            id: 0,
            severity,
            category: category.to_string(),
            description: description.into(),
            file: None,
            line: None,
            resolved: false,
            resolution_note: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Attach a file location
    pub fn at(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }

    /// Identity used to recognise the same problem across audits
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}",
            self.category.trim().to_lowercase(),
            self.file.as_deref().map(normalize_path).unwrap_or_default(),
            self.description.trim().to_lowercase()
        )
    }
}

/// A question one agent asked another
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Clarification {
    #[serde(default)]
    pub id: u32,
    pub from: String,
    pub to: String,
    pub question: String,
    #[serde(default)]
    pub answer: Option<String>,
    /// Bus message carrying the request, if one was sent
    #[serde(default)]
    pub message_id: Option<String>,
    pub asked_at: DateTime<Utc>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
}

impl Clarification {
    pub fn new(from: &str, to: &str, question: impl Into<String>) -> Self {
        Self {
            id: 0,
            from: from.to_string(),
            to: to.to_string(),
            question: question.into(),
            answer: None,
            message_id: None,
            asked_at: Utc::now(),
            answered_at: None,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }
}

/// Everything the agents learned while working on one stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageMemory {
    pub stage_id: StageId,
    pub stage_name: String,
    pub decisions: Vec<Decision>,
    pub findings: Vec<Finding>,
    pub clarifications: Vec<Clarification>,
    /// Build/audit iterations run against this stage
    pub iterations: u32,
    #[serde(default)]
    pub final_status: Option<StageOutcome>,
    /// Free-text narrative written when the stage finishes
    #[serde(default)]
    pub summary: String,
    /// Stage whose memory feeds this one's context
    #[serde(default)]
    pub previous_stage_id: Option<StageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageMemory {
    pub fn new(stage_id: &str, stage_name: &str) -> Self {
        let now = Utc::now();
        Self {
            stage_id: stage_id.to_string(),
            stage_name: stage_name.to_string(),
            decisions: Vec::new(),
            findings: Vec::new(),
            clarifications: Vec::new(),
            iterations: 0,
            final_status: None,
            summary: String::new(),
            previous_stage_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn unresolved_findings(&self) -> Vec<Finding> {
        self.findings.iter().filter(|f| !f.resolved).cloned().collect()
    }

    pub fn unanswered_clarifications(&self) -> Vec<Clarification> {
        self.clarifications
            .iter()
            .filter(|c| !c.is_answered())
            .cloned()
            .collect()
    }

    pub(crate) fn push_finding(&mut self, mut finding: Finding) -> u32 {
        let id = self.findings.len() as u32 + 1;
        finding.id = id;
        self.findings.push(finding);
        id
    }

    pub(crate) fn push_clarification(&mut self, mut clarification: Clarification) -> u32 {
        let id = self.clarifications.len() as u32 + 1;
        clarification.id = id;
        self.clarifications.push(clarification);
        id
    }
}

/// Context handed from a finished stage to the one that follows it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviousStageContext {
    pub stage_id: StageId,
    pub stage_name: String,
    pub summary: String,
    pub final_status: Option<StageOutcome>,
    pub decisions: Vec<Decision>,
    pub unresolved_findings: Vec<Finding>,
    pub unanswered_clarifications: Vec<Clarification>,
}

impl PreviousStageContext {
    pub fn from_memory(memory: &StageMemory) -> Self {
        Self {
            stage_id: memory.stage_id.clone(),
            stage_name: memory.stage_name.clone(),
            summary: memory.summary.clone(),
            final_status: memory.final_status,
            decisions: memory.decisions.clone(),
            unresolved_findings: memory.unresolved_findings(),
            unanswered_clarifications: memory.unanswered_clarifications(),
        }
    }
}
