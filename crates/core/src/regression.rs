//! # Regression Detector
//!
//! Attributes fresh findings to earlier completed stages by file provenance.
//!
//! For every finding that names a file, the implicated stage is the completed
//! stage (other than the current one) that touched the file most recently.
//! When several stages are implicated the earliest one wins: earliest
//! completion, then earliest roadmap position. A finding on a file no prior
//! stage touched is an ordinary fix, not a regression.
//!
//! This is a heuristic. A false positive costs one extra audit of the
//! reopened stage; a missed regression is the failure to avoid.

use crate::memory::Finding;
use crate::roadmap::{Roadmap, StageId, StageStatus};
use crate::summary::{normalize_path, StageSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An earlier stage the current findings were traced to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegressionVerdict {
    /// Stage to reopen
    pub target: StageId,
    pub target_name: String,
    /// Normalised paths that led to the target
    pub implicated_paths: Vec<String>,
    /// Every stage any finding mapped to, in selection order
    pub implicated_stages: Vec<StageId>,
    pub reason: String,
}

/// Trace `findings` of `current_stage_id` back to an earlier completed stage.
///
/// Resolved findings and findings without a file are ignored. Returns `None`
/// when no finding maps to a prior stage. The result depends only on the
/// inputs, so repeated calls agree.
pub fn detect_regression(
    current_stage_id: &str,
    findings: &[Finding],
    roadmap: &Roadmap,
    summaries: &[StageSummary],
) -> Option<RegressionVerdict> {
    let candidates: Vec<&StageSummary> = summaries
        .iter()
        .filter(|s| s.stage_id != current_stage_id)
        .filter(|s| {
            roadmap
                .get(&s.stage_id)
                .map(|stage| stage.status == StageStatus::Completed)
                .unwrap_or(false)
        })
        .collect();
    if candidates.is_empty() {
        return None;
    }

    // stage id -> paths attributed to it
    let mut implicated: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for finding in findings.iter().filter(|f| !f.resolved) {
        let Some(file) = finding.file.as_deref() else {
            continue;
        };
        let path = normalize_path(file);
        if let Some(owner) = last_toucher(&candidates, &path, roadmap) {
            let paths = implicated.entry(owner).or_default();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    if implicated.is_empty() {
        return None;
    }

    let mut ranked: Vec<(&str, Option<DateTime<Utc>>, usize)> = implicated
        .keys()
        .filter_map(|id| roadmap.get(id).map(|s| (*id, s.completed_at, s.position)))
        .collect();
    ranked.sort_by(|a, b| {
        let by_completion = match (a.1, b.1) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        by_completion.then(a.2.cmp(&b.2))
    });

    let (target, _, _) = *ranked.first()?;
    let stage = roadmap.get(target)?;
    let paths = implicated.remove(target).unwrap_or_default();
    let current_name = roadmap
        .get(current_stage_id)
        .map(|s| s.name.as_str())
        .unwrap_or(current_stage_id);

    Some(RegressionVerdict {
        target: target.to_string(),
        target_name: stage.name.clone(),
        reason: format!(
            "Findings in '{}' reference {} last changed by completed stage '{}'",
            current_name,
            paths.join(", "),
            stage.name
        ),
        implicated_paths: paths,
        implicated_stages: ranked.iter().map(|(id, _, _)| id.to_string()).collect(),
    })
}

/// Candidate stage that touched `path` most recently; later position breaks ties
fn last_toucher<'a>(
    candidates: &[&'a StageSummary],
    path: &str,
    roadmap: &Roadmap,
) -> Option<&'a str> {
    let position = |id: &str| roadmap.get(id).map(|s| s.position);
    candidates
        .iter()
        .copied()
        .filter_map(|s| s.last_touch(path).map(|at| (s, at)))
        .max_by(|(a, at_a), (b, at_b)| {
            at_a.cmp(at_b)
                .then(position(a.stage_id.as_str()).cmp(&position(b.stage_id.as_str())))
        })
        .map(|(s, _)| s.stage_id.as_str())
}
