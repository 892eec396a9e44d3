//! Scripted agents for driving runs in tests.

use super::agents::{AuditReport, BuildOutput, Builder, Planner, Reviewer, RoadmapCommand, StageContext};
use crate::bus::Message;
use crate::memory::Finding;
use crate::roadmap::{Roadmap, Stage};
use crate::routing::{ModelConfig, ModelRouter};
use crate::summary::FileChange;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Builder that writes a fixed file set per stage name.
///
/// Stages without a script create `<name>.html`.
#[derive(Default)]
pub struct ScriptedBuilder {
    files: HashMap<String, Vec<FileChange>>,
    failures: Mutex<HashMap<String, u32>>,
    pub calls: Mutex<Vec<(String, usize)>>,
}

impl ScriptedBuilder {
    pub fn writes(mut self, stage: &str, files: &[&str]) -> Self {
        self.files.insert(
            stage.to_string(),
            files.iter().map(|f| FileChange::modified(*f).with_stats(10, 2, 512)).collect(),
        );
        self
    }

    /// Fail the next `times` builds of `stage`
    pub fn failing(self, stage: &str, times: u32) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(stage.to_string(), times);
        }
        self
    }

    pub fn call_count(&self, stage: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|(name, _)| name == stage).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Builder for ScriptedBuilder {
    async fn build(&self, ctx: &StageContext, unresolved: &[Finding]) -> Result<BuildOutput> {
        let name = ctx.stage.name.clone();
        self.calls
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .push((name.clone(), unresolved.len()));

        {
            let mut failures = self
                .failures
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            if let Some(left) = failures.get_mut(&name) {
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("builder timed out on {}", name);
                }
            }
        }

        let files_changed = self
            .files
            .get(&name)
            .cloned()
            .unwrap_or_else(|| vec![FileChange::created(format!("{}.html", name.to_lowercase()))]);
        Ok(BuildOutput {
            files_changed,
            notes: String::new(),
            decisions: Vec::new(),
            cost_usd: 0.02,
        })
    }
}

/// Reviewer that replays queued reports per stage name, then comes back clean
#[derive(Default)]
pub struct ScriptedReviewer {
    reports: Mutex<HashMap<String, VecDeque<AuditReport>>>,
    pub audited_files: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedReviewer {
    pub fn then(self, stage: &str, findings: Vec<Finding>) -> Self {
        self.then_report(
            stage,
            AuditReport {
                findings,
                clarifications: Vec::new(),
                cost_usd: 0.01,
            },
        )
    }

    pub fn then_report(self, stage: &str, report: AuditReport) -> Self {
        if let Ok(mut reports) = self.reports.lock() {
            reports.entry(stage.to_string()).or_default().push_back(report);
        }
        self
    }

    pub fn audit_count(&self, stage: &str) -> usize {
        self.audited_files
            .lock()
            .map(|a| a.iter().filter(|(name, _)| name == stage).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    async fn audit(&self, ctx: &StageContext, current_files: &[String]) -> Result<AuditReport> {
        self.audited_files
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .push((ctx.stage.name.clone(), current_files.to_vec()));
        let next = self
            .reports
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .get_mut(&ctx.stage.name)
            .and_then(|queue| queue.pop_front());
        Ok(next.unwrap_or_default())
    }
}

/// Planner that records what it was sent and replays scripted commands
#[derive(Default)]
pub struct ScriptedPlanner {
    commands: Mutex<VecDeque<Vec<RoadmapCommand>>>,
    answer: Option<String>,
    pub received: Mutex<Vec<Message>>,
}

impl ScriptedPlanner {
    pub fn responds_with(self, commands: Vec<RoadmapCommand>) -> Self {
        if let Ok(mut queue) = self.commands.lock() {
            queue.push_back(commands);
        }
        self
    }

    pub fn answers(mut self, answer: &str) -> Self {
        self.answer = Some(answer.to_string());
        self
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn review_report(&self, message: &Message, _roadmap: &Roadmap) -> Result<Vec<RoadmapCommand>> {
        self.received
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .push(message.clone());
        Ok(self
            .commands
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .pop_front()
            .unwrap_or_default())
    }

    async fn answer_clarification(&self, message: &Message) -> Result<Option<String>> {
        self.received
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .push(message.clone());
        Ok(self.answer.clone())
    }
}

/// Router that always fails, standing in for an exhausted spend cap
pub struct FailingRouter;

#[async_trait]
impl ModelRouter for FailingRouter {
    async fn select(&self, _agent: &str, _stage: &Stage) -> Result<ModelConfig> {
        anyhow::bail!("spend cap reached")
    }
}
