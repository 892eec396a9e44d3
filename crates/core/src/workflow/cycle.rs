//! # Audit-Fix Cycle Controller
//!
//! Bounded build→audit loop for the active stage.
//!
//! ```text
//! building → auditing ─┬─ no findings ─────────────────▶ auto_advance
//!     ▲                ├─ findings, audits left ───────▶ fix_needed ─┐
//!     └────────────────┼───────────────────────────────────────────────┘
//!                      ├─ findings, bound reached ─────▶ exhausted
//!                      └─ findings traced to earlier ──▶ regression
//! ```
//!
//! Each cycle is written to the stage summary before the next one starts. A
//! controller restarted on a stage whose current activation already ended in
//! a terminal cycle returns that outcome without calling any agent.

use super::agents::{Agents, AuditReport, BuildOutput, StageContext};
use super::events::{EventSink, WorkflowEvent, WorkflowEventKind};
use super::manager::WorkflowManager;
use crate::bus::MessageKind;
use crate::config::WorkflowConfig;
use crate::error::RoadmapError;
use crate::memory::{Clarification, Decision, DecisionKind, Finding};
use crate::regression::{detect_regression, RegressionVerdict};
use crate::roadmap::{StageId, StageStatus};
use crate::summary::{normalize_path, CycleStatus, FixCycle};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;

/// Verdict for one audit.
///
/// `audit_count` already includes the audit being judged and never exceeds
/// `max_audits`; a count past the bound means the budget was lost track of.
pub fn decide(finding_count: usize, audit_count: u32, max_audits: u32) -> Result<CycleStatus> {
    if audit_count > max_audits {
        anyhow::bail!(
            "Audit {} exceeds the bound of {} audits",
            audit_count,
            max_audits
        );
    }
    Ok(if finding_count == 0 {
        CycleStatus::AutoAdvance
    } else if audit_count < max_audits {
        CycleStatus::FixNeeded
    } else {
        CycleStatus::Exhausted
    })
}

/// How the loop for a stage ended
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    AutoAdvanced,
    /// Bound reached with findings open
    Exhausted { open_findings: usize },
    Regression(RegressionVerdict),
    /// Stopped between cycles on request
    Aborted,
}

/// Result of driving one stage
#[derive(Debug, Clone)]
pub struct StageRun {
    pub stage_id: StageId,
    pub outcome: LoopOutcome,
    /// Cycles executed by this call
    pub cycles_run: u32,
    /// The outcome came from an already recorded cycle
    pub resumed: bool,
}

/// Runs the audit-fix loop against the configured agents
pub struct AuditFixController<'a> {
    config: &'a WorkflowConfig,
    agents: &'a Agents,
}

/// Output of the agent calls within one cycle
struct CycleWork {
    model: Option<String>,
    build: Option<BuildOutput>,
    audit: Option<AuditReport>,
    failure: Option<String>,
}

impl<'a> AuditFixController<'a> {
    pub fn new(config: &'a WorkflowConfig, agents: &'a Agents) -> Self {
        Self { config, agents }
    }

    /// Drive the active stage until a terminal cycle or until `should_stop`
    /// returns true between cycles.
    pub async fn run_stage(
        &self,
        manager: &mut WorkflowManager,
        events: &mut EventSink,
        stage_id: &str,
        mut should_stop: impl FnMut() -> bool,
    ) -> Result<StageRun> {
        if let Some(summary) = manager.summaries().load(stage_id)? {
            let recorded = summary.current_activation_cycles();
            // a crash right after record_cycle leaves the stored count behind
            let audits = recorded.len() as u32;
            let stage = manager.stage(stage_id)?;
            if stage.status == StageStatus::Active && stage.audit_count < audits {
                manager.record_audit(stage_id, audits)?;
            }

            if let Some(last) = recorded.last().filter(|c| c.status.is_terminal()).cloned() {
                tracing::info!(
                    stage_id = %stage_id,
                    cycle = last.cycle_number,
                    status = %last.status,
                    "Resuming from recorded terminal cycle"
                );
                events
                    .emit(
                        WorkflowEvent::new(WorkflowEventKind::StageResumed, &self.config.orchestrator_agent)
                            .with_stage(stage_id)
                            .with_data(serde_json::json!({ "cycle": last.cycle_number, "status": last.status })),
                    )
                    .await;
                return Ok(StageRun {
                    stage_id: stage_id.to_string(),
                    outcome: self.outcome_of(manager, &last)?,
                    cycles_run: 0,
                    resumed: true,
                });
            }
        }

        let mut cycles_run = 0;
        loop {
            if should_stop() {
                tracing::info!(stage_id = %stage_id, "Stopping between cycles");
                return Ok(StageRun {
                    stage_id: stage_id.to_string(),
                    outcome: LoopOutcome::Aborted,
                    cycles_run,
                    resumed: false,
                });
            }

            let (cycle, verdict) = self.run_cycle(manager, events, stage_id).await?;
            cycles_run += 1;

            let outcome = match cycle.status {
                CycleStatus::FixNeeded => continue,
                CycleStatus::AutoAdvance => LoopOutcome::AutoAdvanced,
                CycleStatus::Exhausted => LoopOutcome::Exhausted {
                    open_findings: cycle.finding_count,
                },
                CycleStatus::Regression => match verdict {
                    Some(verdict) => LoopOutcome::Regression(verdict),
                    None => self.outcome_of(manager, &cycle)?,
                },
            };
            return Ok(StageRun {
                stage_id: stage_id.to_string(),
                outcome,
                cycles_run,
                resumed: false,
            });
        }
    }

    /// One building → auditing pass, durably recorded
    pub async fn run_cycle(
        &self,
        manager: &mut WorkflowManager,
        events: &mut EventSink,
        stage_id: &str,
    ) -> Result<(FixCycle, Option<RegressionVerdict>)> {
        let started_at = Utc::now();
        let stage = manager.stage(stage_id)?.clone();
        if stage.status != StageStatus::Active {
            return Err(RoadmapError::NotMutable {
                id: stage.id,
                status: stage.status,
                operation: "audited",
            }
            .into());
        }
        manager.memory().get_or_create(stage_id, &stage.name)?;
        let summary = manager.summaries().get_or_create(stage_id, &stage.name)?;
        let cycle_number = summary.next_cycle_number();
        // merges and splits carry the count over to a stage with no cycles yet
        let audit_count = stage
            .audit_count
            .max(summary.current_activation_cycles().len() as u32)
            + 1;

        self.collect_answers(manager, stage_id)?;
        manager.memory().record_iteration(stage_id)?;

        let unresolved = manager.memory().get_unresolved_findings(stage_id)?;
        let issues_addressed: Vec<String> = summary.open_issues().map(|i| i.id.clone()).collect();
        let answered: Vec<Clarification> = manager
            .memory()
            .load(stage_id)?
            .map(|m| m.clarifications.into_iter().filter(|c| c.is_answered()).collect())
            .unwrap_or_default();
        let mut ctx = StageContext {
            run_id: manager.run_id().to_string(),
            plan_steps: stage
                .plan_steps
                .iter()
                .filter_map(|i| manager.roadmap().plan_steps.get(*i).cloned())
                .collect(),
            stage,
            cycle: cycle_number,
            model: None,
            previous: manager.memory().build_context_for_next_stage(stage_id)?,
            answered_clarifications: answered,
        };

        events
            .emit(
                WorkflowEvent::new(WorkflowEventKind::CycleStarted, &self.config.orchestrator_agent)
                    .with_stage(stage_id)
                    .with_data(serde_json::json!({
                        "cycle": cycle_number,
                        "unresolved": unresolved.len(),
                    })),
            )
            .await;

        let work = self
            .call_agents(manager, events, &mut ctx, &unresolved, cycle_number)
            .await?;

        let mut cycle = FixCycle {
            cycle_number,
            builder: self.config.builder_agent.clone(),
            model: work.model.clone(),
            issues_addressed,
            files_changed: work
                .build
                .as_ref()
                .map(|b| b.files_changed.iter().map(|f| normalize_path(&f.path)).collect())
                .unwrap_or_default(),
            finding_count: 0,
            status: CycleStatus::FixNeeded,
            degraded: false,
            note: None,
            regression_target: None,
            cost_usd: work.build.as_ref().map(|b| b.cost_usd).unwrap_or(0.0)
                + work.audit.as_ref().map(|a| a.cost_usd).unwrap_or(0.0),
            started_at,
            completed_at: started_at,
        };

        let mut verdict = None;
        match (&work.audit, &work.failure) {
            (Some(audit), None) => {
                cycle.finding_count = audit.findings.len();
                self.record_findings(manager, stage_id, cycle_number, &audit.findings)?;
                self.ask_clarifications(manager, events, stage_id, &audit.clarifications)
                    .await?;

                verdict = if audit.findings.is_empty() {
                    None
                } else {
                    self.check_regression(manager, stage_id, &audit.findings)?
                };
                cycle.status = match &verdict {
                    Some(v) => {
                        cycle.regression_target = Some(v.target.clone());
                        cycle.note = Some(v.reason.clone());
                        CycleStatus::Regression
                    }
                    None => decide(audit.findings.len(), audit_count, self.config.max_audits)?,
                };
            }
            (_, failure) => {
                // no progress, but the audit still counts against the bound
                cycle.degraded = true;
                cycle.note = failure.clone();
                cycle.finding_count = manager.memory().get_unresolved_findings(stage_id)?.len();
                cycle.status = decide(1, audit_count, self.config.max_audits)?;
            }
        }

        cycle.completed_at = Utc::now();
        manager.summaries().record_cycle(stage_id, cycle.clone())?;
        manager.record_audit(stage_id, audit_count)?;
        events
            .emit(
                WorkflowEvent::new(WorkflowEventKind::CycleRecorded, &self.config.orchestrator_agent)
                    .with_stage(stage_id)
                    .with_data(serde_json::json!({
                        "cycle": cycle.cycle_number,
                        "status": cycle.status,
                        "findings": cycle.finding_count,
                        "degraded": cycle.degraded,
                        "audit_count": audit_count,
                    })),
            )
            .await;

        self.announce(manager, events, stage_id, &cycle, audit_count).await?;
        Ok((cycle, verdict))
    }

    /// Router, builder and reviewer calls; the first failure ends the cycle
    async fn call_agents(
        &self,
        manager: &mut WorkflowManager,
        events: &mut EventSink,
        ctx: &mut StageContext,
        unresolved: &[Finding],
        cycle_number: u32,
    ) -> Result<CycleWork> {
        let stage_id = ctx.stage.id.clone();
        let mut work = CycleWork {
            model: None,
            build: None,
            audit: None,
            failure: None,
        };

        match self
            .agents
            .router
            .select(&self.config.builder_agent, &ctx.stage)
            .await
        {
            Ok(model) => {
                work.model = Some(model.model.clone());
                ctx.model = Some(model);
            }
            Err(e) => {
                self.agent_failed(events, &stage_id, "router", &e).await;
                work.failure = Some(format!("Model routing failed: {:#}", e));
                return Ok(work);
            }
        }

        let build = match self.agents.builder.build(ctx, unresolved).await {
            Ok(build) => build,
            Err(e) => {
                self.agent_failed(events, &stage_id, &self.config.builder_agent, &e)
                    .await;
                work.failure = Some(format!("Builder failed: {:#}", e));
                return Ok(work);
            }
        };
        manager
            .summaries()
            .record_file_changes(&stage_id, cycle_number, &build.files_changed)?;
        for decision in &build.decisions {
            manager.memory().add_decision(&stage_id, decision.clone())?;
        }
        if !build.notes.is_empty() {
            manager.memory().add_decision(
                &stage_id,
                Decision::new(&self.config.builder_agent, DecisionKind::Implementation, build.notes.clone())
                    .with_context(format!("cycle {}", cycle_number)),
            )?;
        }
        work.build = Some(build);

        let current_files = manager
            .summaries()
            .load(&stage_id)?
            .map(|s| s.current_files())
            .unwrap_or_default();
        match self.agents.reviewer.audit(ctx, &current_files).await {
            Ok(audit) => work.audit = Some(audit),
            Err(e) => {
                self.agent_failed(events, &stage_id, &self.config.reviewer_agent, &e)
                    .await;
                work.failure = Some(format!("Reviewer failed: {:#}", e));
            }
        }
        Ok(work)
    }

    async fn agent_failed(&self, events: &mut EventSink, stage_id: &str, agent: &str, error: &anyhow::Error) {
        tracing::warn!(stage_id = %stage_id, agent = %agent, error = %error, "Agent call failed; cycle degraded");
        events
            .emit(
                WorkflowEvent::new(WorkflowEventKind::AgentFailed, agent)
                    .with_stage(stage_id)
                    .with_data(serde_json::json!({ "error": error.to_string() })),
            )
            .await;
    }

    /// Sync memory and the issue registry with one audit's findings
    fn record_findings(
        &self,
        manager: &WorkflowManager,
        stage_id: &str,
        cycle_number: u32,
        findings: &[Finding],
    ) -> Result<()> {
        let delta = manager
            .summaries()
            .reconcile_issues(stage_id, cycle_number, findings)?;

        let reported: HashSet<String> = findings.iter().map(|f| f.fingerprint()).collect();
        let open = manager.memory().get_unresolved_findings(stage_id)?;
        let mut known = HashSet::new();
        for finding in &open {
            let fingerprint = finding.fingerprint();
            if reported.contains(&fingerprint) {
                known.insert(fingerprint);
            } else {
                manager.memory().resolve_finding(
                    stage_id,
                    finding.id,
                    &format!("Not reported by audit in cycle {}", cycle_number),
                )?;
            }
        }
        for finding in findings {
            if known.insert(finding.fingerprint()) {
                manager.memory().add_finding(stage_id, finding.clone())?;
            }
        }

        tracing::debug!(
            stage_id = %stage_id,
            cycle = cycle_number,
            opened = delta.opened.len(),
            still_open = delta.still_open.len(),
            resolved = delta.resolved.len(),
            "Findings reconciled"
        );
        Ok(())
    }

    /// Record reviewer questions and send them to the planner
    async fn ask_clarifications(
        &self,
        manager: &WorkflowManager,
        events: &mut EventSink,
        stage_id: &str,
        questions: &[String],
    ) -> Result<()> {
        for question in questions {
            let clarification =
                Clarification::new(&self.config.reviewer_agent, &self.config.planner_agent, question.clone());
            let clarification_id = manager.memory().add_clarification(stage_id, clarification)?;
            let message_id = manager.bus().send(
                &self.config.reviewer_agent,
                &self.config.planner_agent,
                MessageKind::ClarificationRequest,
                &format!("Question on {}", stage_id),
                question,
                true,
            )?;
            manager
                .memory()
                .attach_clarification_message(stage_id, clarification_id, &message_id)?;
            events
                .emit(
                    WorkflowEvent::new(WorkflowEventKind::MessageSent, &self.config.reviewer_agent)
                        .with_stage(stage_id)
                        .with_data(serde_json::json!({
                            "message_id": message_id,
                            "kind": MessageKind::ClarificationRequest,
                        })),
                )
                .await;
        }
        Ok(())
    }

    /// Fold bus answers into the stage's clarifications
    fn collect_answers(&self, manager: &WorkflowManager, stage_id: &str) -> Result<()> {
        for clarification in manager.memory().get_unanswered_clarifications(stage_id)? {
            let Some(message_id) = clarification.message_id.as_deref() else {
                continue;
            };
            if let Some(response) = manager.bus().get_response(message_id)? {
                manager
                    .memory()
                    .answer_clarification(stage_id, clarification.id, &response.body)?;
                manager.bus().mark_read(&response.id)?;
            }
        }
        Ok(())
    }

    /// Regression verdict, unless the target already used up its reopens
    fn check_regression(
        &self,
        manager: &WorkflowManager,
        stage_id: &str,
        findings: &[Finding],
    ) -> Result<Option<RegressionVerdict>> {
        let summaries = manager.summaries().list()?;
        let Some(verdict) = detect_regression(stage_id, findings, manager.roadmap(), &summaries) else {
            return Ok(None);
        };

        let reopens = manager
            .roadmap()
            .get(&verdict.target)
            .map(|s| s.reopen_count)
            .unwrap_or(0);
        if reopens >= self.config.max_reopens_per_stage {
            tracing::warn!(
                stage_id = %stage_id,
                target = %verdict.target,
                reopens,
                "Regression target reached its reopen limit; fixing in place"
            );
            manager.memory().add_decision(
                stage_id,
                Decision::new(
                    &self.config.orchestrator_agent,
                    DecisionKind::Verdict,
                    format!(
                        "Regression traced to '{}' handled as a fix: reopen limit of {} reached",
                        verdict.target_name, self.config.max_reopens_per_stage
                    ),
                ),
            )?;
            return Ok(None);
        }
        Ok(Some(verdict))
    }

    /// Bus notices for terminal verdicts
    async fn announce(
        &self,
        manager: &WorkflowManager,
        events: &mut EventSink,
        stage_id: &str,
        cycle: &FixCycle,
        audit_count: u32,
    ) -> Result<()> {
        let stage_name = manager.stage(stage_id)?.name.clone();
        let (kind, to, subject, body) = match cycle.status {
            CycleStatus::AutoAdvance => (
                MessageKind::AutoAdvanceRequest,
                &self.config.orchestrator_agent,
                format!("Stage '{}' passed review", stage_name),
                format!(
                    "Audit {} of stage {} found no issues; advancing.",
                    audit_count, stage_id
                ),
            ),
            CycleStatus::Exhausted => {
                let summary = manager.summaries().load(stage_id)?;
                let open: Vec<String> = summary
                    .iter()
                    .flat_map(|s| s.open_issues())
                    .map(|i| format!("- {} [{}] {}: {}", i.id, i.severity, i.category, i.description))
                    .collect();
                (
                    MessageKind::Report,
                    &self.config.planner_agent,
                    format!("Stage '{}' exhausted its audits", stage_name),
                    format!(
                        "Stage {} reached {} audits with findings remaining{}.\n{}",
                        stage_id,
                        audit_count,
                        match (&cycle.degraded, &cycle.note) {
                            (true, Some(note)) => format!(" (last cycle degraded: {})", note),
                            (true, None) => " (last cycle degraded)".to_string(),
                            (false, _) => String::new(),
                        },
                        open.join("\n")
                    ),
                )
            }
            CycleStatus::FixNeeded | CycleStatus::Regression => return Ok(()),
        };

        let message_id = manager.bus().send(
            &self.config.reviewer_agent,
            to,
            kind,
            &subject,
            &body,
            false,
        )?;
        manager.memory().add_decision(
            stage_id,
            Decision::new(&self.config.reviewer_agent, DecisionKind::Verdict, subject),
        )?;
        events
            .emit(
                WorkflowEvent::new(WorkflowEventKind::MessageSent, &self.config.reviewer_agent)
                    .with_stage(stage_id)
                    .with_data(serde_json::json!({ "message_id": message_id, "kind": kind })),
            )
            .await;
        Ok(())
    }

    /// Outcome represented by an already recorded terminal cycle
    fn outcome_of(&self, manager: &WorkflowManager, cycle: &FixCycle) -> Result<LoopOutcome> {
        Ok(match cycle.status {
            CycleStatus::AutoAdvance => LoopOutcome::AutoAdvanced,
            CycleStatus::Exhausted => LoopOutcome::Exhausted {
                open_findings: cycle.finding_count,
            },
            CycleStatus::Regression => {
                let target = cycle.regression_target.clone().unwrap_or_default();
                let stage = manager.stage(&target)?;
                LoopOutcome::Regression(RegressionVerdict {
                    target: target.clone(),
                    target_name: stage.name.clone(),
                    implicated_paths: Vec::new(),
                    implicated_stages: vec![target],
                    reason: cycle.note.clone().unwrap_or_default(),
                })
            }
            CycleStatus::FixNeeded => {
                anyhow::bail!("Cycle {} is not terminal", cycle.cycle_number)
            }
        })
    }
}
