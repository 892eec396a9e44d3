//! # Stage Summary
//!
//! The authoritative execution record of a stage: every fix cycle, every file
//! the builder touched, the issue registry and accumulated cost. Distinct from
//! `StageMemory`, which holds the narrative.

use crate::memory::{Finding, Severity};
use crate::roadmap::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// How a file was touched
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

/// One file touched by a build
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileChange {
    pub path: String,
    pub change_type: ChangeType,
    #[serde(default)]
    pub lines_added: u32,
    #[serde(default)]
    pub lines_removed: u32,
    #[serde(default)]
    pub size_bytes: u64,
}

impl FileChange {
    pub fn new(path: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            path: path.into(),
            change_type,
            lines_added: 0,
            lines_removed: 0,
            size_bytes: 0,
        }
    }

    pub fn created(path: impl Into<String>) -> Self {
        Self::new(path, ChangeType::Created)
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self::new(path, ChangeType::Modified)
    }

    pub fn with_stats(mut self, lines_added: u32, lines_removed: u32, size_bytes: u64) -> Self {
        self.lines_added = lines_added;
        self.lines_removed = lines_removed;
        self.size_bytes = size_bytes;
        self
    }
}

/// A file change tagged with the cycle that produced it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileChangeRecord {
    pub cycle: u32,
    pub change: FileChange,
    pub recorded_at: DateTime<Utc>,
}

/// Normalise a path for attribution (`./src\a.rs` -> `src/a.rs`)
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut trimmed = unified.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.to_string()
}

/// Result of one build→audit iteration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Reviewer found nothing; the stage completes
    AutoAdvance,
    /// Findings remain and audits are left
    FixNeeded,
    /// Findings remain and the audit bound is reached
    Exhausted,
    /// Findings were traced to an earlier stage
    Regression,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoAdvance => "auto_advance",
            Self::FixNeeded => "fix_needed",
            Self::Exhausted => "exhausted",
            Self::Regression => "regression",
        }
    }

    /// Whether the stage loop stops after this cycle
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::FixNeeded)
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one fix cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixCycle {
    pub cycle_number: u32,
    /// Builder identity
    pub builder: String,
    /// Model the router picked for the builder
    #[serde(default)]
    pub model: Option<String>,
    /// Issue ids the build was asked to fix
    pub issues_addressed: Vec<String>,
    /// Paths the build touched
    pub files_changed: Vec<String>,
    /// Findings the reviewer reported
    pub finding_count: usize,
    pub status: CycleStatus,
    /// An agent or routing call failed; the cycle made no progress
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub regression_target: Option<StageId>,
    #[serde(default)]
    pub cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// A finding tracked across audits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    /// `ISS-N`, unique within the stage
    pub id: String,
    pub fingerprint: String,
    pub severity: Severity,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub file: Option<String>,
    pub first_seen_cycle: u32,
    pub last_seen_cycle: u32,
    pub resolved: bool,
    #[serde(default)]
    pub resolved_in_cycle: Option<u32>,
}

/// Final outcome of a stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Reviewer came back clean
    AutoAdvanced,
    /// Audit bound reached with findings remaining; completed with caveats
    Exhausted,
    /// Stopped because an earlier stage was reopened
    RegressionDeferred,
    /// Completed by an explicit caller decision
    Completed,
    Skipped,
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoAdvanced => "auto_advanced",
            Self::Exhausted => "exhausted",
            Self::RegressionDeferred => "regression_deferred",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Issue registry changes caused by one audit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueDelta {
    pub opened: Vec<String>,
    pub still_open: Vec<String>,
    pub resolved: Vec<String>,
}

/// Execution record of a stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageSummary {
    pub stage_id: StageId,
    pub stage_name: String,
    pub cycles: Vec<FixCycle>,
    pub file_changes: Vec<FileChangeRecord>,
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub regression_detected: bool,
    #[serde(default)]
    pub regression_target: Option<StageId>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub final_status: Option<StageOutcome>,
    /// Live stages that replaced this one after a merge or split
    #[serde(default)]
    pub superseded_by: Vec<StageId>,
    /// Cycles recorded before the stage was last (re)started
    #[serde(default)]
    pub activated_at_cycle: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageSummary {
    pub fn new(stage_id: &str, stage_name: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            stage_name: stage_name.to_string(),
            cycles: Vec::new(),
            file_changes: Vec::new(),
            issues: Vec::new(),
            regression_detected: false,
            regression_target: None,
            cost_usd: 0.0,
            final_status: None,
            superseded_by: Vec::new(),
            activated_at_cycle: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn last_cycle(&self) -> Option<&FixCycle> {
        self.cycles.last()
    }

    /// Cycles run since the stage was last (re)started
    pub fn current_activation_cycles(&self) -> &[FixCycle] {
        let start = (self.activated_at_cycle as usize).min(self.cycles.len());
        &self.cycles[start..]
    }

    /// Number the next cycle will carry
    pub fn next_cycle_number(&self) -> u32 {
        self.cycles.len() as u32 + 1
    }

    pub(crate) fn push_cycle(&mut self, cycle: FixCycle) {
        self.cost_usd += cycle.cost_usd;
        self.cycles.push(cycle);
    }

    /// Record one build's changes; a replayed cycle replaces its earlier records
    pub(crate) fn push_file_changes(&mut self, cycle: u32, changes: &[FileChange]) {
        let now = Utc::now();
        self.file_changes.retain(|r| r.cycle != cycle);
        for change in changes {
            let mut change = change.clone();
            change.path = normalize_path(&change.path);
            self.file_changes.push(FileChangeRecord {
                cycle,
                change,
                recorded_at: now,
            });
        }
    }

    /// When this stage last touched `path` (normalised), if ever
    pub fn last_touch(&self, path: &str) -> Option<DateTime<Utc>> {
        let path = normalize_path(path);
        self.file_changes
            .iter()
            .filter(|r| r.change.path == path)
            .map(|r| r.recorded_at)
            .max()
    }

    /// Files that exist after this stage's builds, in first-touch order
    pub fn current_files(&self) -> Vec<String> {
        let mut latest: BTreeMap<&str, ChangeType> = BTreeMap::new();
        let mut order = Vec::new();
        for record in &self.file_changes {
            let path = record.change.path.as_str();
            if latest.insert(path, record.change.change_type).is_none() {
                order.push(path);
            }
        }
        order
            .into_iter()
            .filter(|p| latest.get(p) != Some(&ChangeType::Deleted))
            .map(str::to_string)
            .collect()
    }

    pub fn open_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| !i.resolved)
    }

    /// Fold one audit's findings into the issue registry.
    ///
    /// Findings matching an open issue keep it open; new ones open issues;
    /// open issues the audit no longer reports are resolved.
    pub(crate) fn reconcile_issues(&mut self, cycle: u32, findings: &[Finding]) -> IssueDelta {
        let mut delta = IssueDelta::default();
        let mut reported = HashSet::new();

        for finding in findings {
            let fingerprint = finding.fingerprint();
            if !reported.insert(fingerprint.clone()) {
                continue;
            }
            match self
                .issues
                .iter_mut()
                .find(|i| !i.resolved && i.fingerprint == fingerprint)
            {
                Some(issue) => {
                    issue.last_seen_cycle = cycle;
                    delta.still_open.push(issue.id.clone());
                }
                None => {
                    let id = format!("ISS-{}", self.issues.len() + 1);
                    self.issues.push(Issue {
                        id: id.clone(),
                        fingerprint,
                        severity: finding.severity,
                        category: finding.category.clone(),
                        description: finding.description.clone(),
                        file: finding.file.as_deref().map(normalize_path),
                        first_seen_cycle: cycle,
                        last_seen_cycle: cycle,
                        resolved: false,
                        resolved_in_cycle: None,
                    });
                    delta.opened.push(id);
                }
            }
        }

        for issue in self.issues.iter_mut().filter(|i| !i.resolved) {
            if !reported.contains(&issue.fingerprint) {
                issue.resolved = true;
                issue.resolved_in_cycle = Some(cycle);
                delta.resolved.push(issue.id.clone());
            }
        }

        delta
    }
}
