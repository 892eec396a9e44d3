//! # Workflow Coordinator
//!
//! Drives a run: picks the next stage, runs the audit-fix loop on it, applies
//! the outcome (complete, complete with caveats, or reopen an earlier stage
//! and defer this one), and hands reports and questions to the planner.
//!
//! Aborting is checked between cycles. An aborted run leaves its state
//! resumable: build a new coordinator over `WorkflowManager::load` and call
//! `run` again.

use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::bus::{Message, MessageFilter, MessageKind};
use crate::config::WorkflowConfig;
use crate::error::RoadmapError;
use crate::memory::{Decision, DecisionKind};
use crate::regression::RegressionVerdict;
use crate::roadmap::{Stage, StageId, StageStatus};
use crate::state::io;
use crate::summary::{normalize_path, StageOutcome};

use super::agents::{Agents, Planner, RoadmapCommand};
use super::cycle::{AuditFixController, LoopOutcome, StageRun};
use super::events::{EventSink, WorkflowEvent, WorkflowEventKind};
use super::manager::WorkflowManager;

/// Commands sent to a running coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowCommand {
    /// Stop after the current cycle
    Abort,
}

/// What happened to one stage during a run
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage_id: StageId,
    pub stage_name: String,
    /// `None` when the run stopped before the stage finished
    pub outcome: Option<StageOutcome>,
    pub cycles: u32,
    pub resumed: bool,
}

/// Result of `Coordinator::run`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    /// One entry per stage activation, in execution order
    pub stages: Vec<StageResult>,
    pub total_cycles: u32,
    pub roadmap_version: u32,
    pub aborted: bool,
    /// Every live stage is completed or skipped
    pub finished: bool,
    pub events: Vec<WorkflowEvent>,
}

/// The run driver
pub struct Coordinator {
    config: WorkflowConfig,
    manager: WorkflowManager,
    agents: Agents,
    events: EventSink,
    command_rx: Option<mpsc::Receiver<WorkflowCommand>>,
    abort_requested: bool,
}

impl Coordinator {
    pub fn new(config: WorkflowConfig, manager: WorkflowManager, agents: Agents) -> Self {
        Self {
            config,
            manager,
            agents,
            events: EventSink::default(),
            command_rx: None,
            abort_requested: false,
        }
    }

    /// Set event channel for streaming events
    pub fn with_event_channel(mut self, tx: mpsc::Sender<WorkflowEvent>) -> Self {
        self.events = EventSink::new(Some(tx));
        self
    }

    /// Set command channel for abort requests
    pub fn with_command_channel(mut self, rx: mpsc::Receiver<WorkflowCommand>) -> Self {
        self.command_rx = Some(rx);
        self
    }

    pub fn manager(&self) -> &WorkflowManager {
        &self.manager
    }

    pub fn into_manager(self) -> WorkflowManager {
        self.manager
    }

    /// Run stages until the roadmap is finished or an abort arrives
    #[tracing::instrument(skip(self), fields(run_id = %self.manager.run_id()))]
    pub async fn run(&mut self) -> Result<RunReport> {
        let agent = self.config.orchestrator_agent.clone();
        self.events
            .emit(
                WorkflowEvent::new(WorkflowEventKind::RunStarted, &agent).with_data(serde_json::json!({
                    "version": self.manager.roadmap().version,
                    "stages": self.manager.roadmap().len(),
                })),
            )
            .await;
        if self.manager.state().aborted {
            self.manager.set_aborted(false)?;
        }

        let mut results = Vec::new();
        let mut total_cycles = 0;
        loop {
            self.deliver_planner_messages().await?;
            if poll_abort(&mut self.command_rx, &mut self.abort_requested) {
                break;
            }

            let stage = match self.manager.get_active_stage() {
                Some(stage) => stage.clone(),
                None => match self.manager.get_next_pending_stage().map(|s| s.id.clone()) {
                    Some(id) => self.begin_stage(&id).await?,
                    None => break,
                },
            };

            let run = {
                let controller = AuditFixController::new(&self.config, &self.agents);
                let rx = &mut self.command_rx;
                let requested = &mut self.abort_requested;
                controller
                    .run_stage(&mut self.manager, &mut self.events, &stage.id, || {
                        poll_abort(rx, requested)
                    })
                    .await?
            };
            total_cycles += run.cycles_run;

            let outcome = self.apply_outcome(&stage, &run).await?;
            results.push(StageResult {
                stage_id: stage.id.clone(),
                stage_name: stage.name.clone(),
                outcome,
                cycles: run.cycles_run,
                resumed: run.resumed,
            });
            if run.outcome == LoopOutcome::Aborted {
                break;
            }
        }

        let aborted = self.abort_requested;
        if aborted {
            self.manager.set_aborted(true)?;
            tracing::warn!(run_id = %self.manager.run_id(), "Run aborted; state is resumable");
        } else {
            self.deliver_planner_messages().await?;
        }

        let kind = if aborted {
            WorkflowEventKind::RunAborted
        } else {
            WorkflowEventKind::RunCompleted
        };
        self.events
            .emit(WorkflowEvent::new(kind, &agent).with_data(serde_json::json!({
                "cycles": total_cycles,
                "version": self.manager.roadmap().version,
            })))
            .await;

        tracing::info!(
            run_id = %self.manager.run_id(),
            total_cycles,
            version = self.manager.roadmap().version,
            aborted,
            "Run finished"
        );

        Ok(RunReport {
            run_id: self.manager.run_id().to_string(),
            stages: results,
            total_cycles,
            roadmap_version: self.manager.roadmap().version,
            aborted,
            finished: self.manager.roadmap().is_finished(),
            events: self.events.events().to_vec(),
        })
    }

    async fn begin_stage(&mut self, id: &str) -> Result<Stage> {
        let previous = if self.config.link_previous_stage {
            self.manager
                .last_completed_before(id)
                .map(|s| s.id.clone())
        } else {
            None
        };

        let reopened = self.manager.stage(id)?.status == StageStatus::Reopened;
        let stage = self.manager.start_stage(id)?;

        if let Some(previous) = previous {
            let already_linked = self
                .manager
                .memory()
                .load(id)?
                .and_then(|m| m.previous_stage_id)
                .is_some();
            if !already_linked {
                self.manager.memory().link_previous_stage(id, &previous)?;
            }
        }

        self.events
            .emit(
                WorkflowEvent::new(WorkflowEventKind::StageStarted, &self.config.orchestrator_agent)
                    .with_stage(id)
                    .with_data(serde_json::json!({
                        "name": stage.name,
                        "position": stage.position,
                        "reopened": reopened,
                    })),
            )
            .await;
        Ok(stage)
    }

    async fn apply_outcome(&mut self, stage: &Stage, run: &StageRun) -> Result<Option<StageOutcome>> {
        let agent = self.config.orchestrator_agent.clone();
        match &run.outcome {
            LoopOutcome::AutoAdvanced => {
                let audits = self.manager.stage(&stage.id)?.audit_count;
                let reason = format!(
                    "Auto-advanced after {} audit(s): reviewer found no issues",
                    audits
                );
                self.manager
                    .complete_stage(&stage.id, StageOutcome::AutoAdvanced, &reason)?;
                self.events
                    .emit(
                        WorkflowEvent::new(WorkflowEventKind::StageAutoAdvanced, &agent)
                            .with_stage(&stage.id)
                            .with_data(serde_json::json!({ "reason": reason })),
                    )
                    .await;
                self.export_report(&stage.id).await?;
                Ok(Some(StageOutcome::AutoAdvanced))
            }
            LoopOutcome::Exhausted { open_findings } => {
                let reason = format!(
                    "Completed with caveats: {} finding(s) open after {} audits",
                    open_findings, self.config.max_audits
                );
                self.manager
                    .complete_stage(&stage.id, StageOutcome::Exhausted, &reason)?;
                self.events
                    .emit(
                        WorkflowEvent::new(WorkflowEventKind::StageExhausted, &agent)
                            .with_stage(&stage.id)
                            .with_data(serde_json::json!({ "reason": reason })),
                    )
                    .await;
                self.export_report(&stage.id).await?;
                Ok(Some(StageOutcome::Exhausted))
            }
            LoopOutcome::Regression(verdict) => {
                self.apply_regression(stage, verdict).await?;
                Ok(Some(StageOutcome::RegressionDeferred))
            }
            LoopOutcome::Aborted => Ok(None),
        }
    }

    /// Reopen the implicated stage and defer the current one
    async fn apply_regression(&mut self, stage: &Stage, verdict: &RegressionVerdict) -> Result<()> {
        let agent = self.config.orchestrator_agent.clone();
        self.manager
            .summaries()
            .mark_regression(&stage.id, &verdict.target)?;
        self.events
            .emit(
                WorkflowEvent::new(WorkflowEventKind::RegressionDetected, &agent)
                    .with_stage(&stage.id)
                    .with_data(serde_json::json!({
                        "target": verdict.target,
                        "paths": verdict.implicated_paths,
                        "reason": verdict.reason,
                    })),
            )
            .await;

        // a resumed run may already have reopened the target
        if self.manager.stage(&verdict.target)?.status == StageStatus::Completed {
            let version = self.manager.reopen_stage(
                &verdict.target,
                &verdict.reason,
                Some(&stage.id),
                &agent,
            )?;
            self.seed_reopened_stage(&stage.id, verdict)?;
            self.events
                .emit(
                    WorkflowEvent::new(WorkflowEventKind::StageReopened, &agent)
                        .with_stage(&verdict.target)
                        .with_data(serde_json::json!({
                            "source": stage.id,
                            "version": version,
                        })),
                )
                .await;
            self.manager.bus().send(
                &agent,
                &self.config.planner_agent,
                MessageKind::Report,
                &format!("Stage '{}' reopened", verdict.target_name),
                &verdict.reason,
                false,
            )?;
        }

        let reason = format!(
            "Deferred until reopened stage '{}' is fixed",
            verdict.target_name
        );
        self.manager.defer_stage(&stage.id, &reason)?;
        self.events
            .emit(
                WorkflowEvent::new(WorkflowEventKind::StageDeferred, &agent)
                    .with_stage(&stage.id)
                    .with_data(serde_json::json!({ "reason": reason })),
            )
            .await;
        Ok(())
    }

    /// Give the reopened stage the findings that implicated it
    fn seed_reopened_stage(&self, source_id: &str, verdict: &RegressionVerdict) -> Result<()> {
        let memory = self.manager.memory();
        for finding in memory.get_unresolved_findings(source_id)? {
            let implicated = finding
                .file
                .as_deref()
                .map(|f| verdict.implicated_paths.contains(&normalize_path(f)))
                .unwrap_or(false);
            if implicated {
                memory.add_finding(&verdict.target, finding)?;
            }
        }
        memory.add_decision(
            &verdict.target,
            Decision::new(
                &self.config.orchestrator_agent,
                DecisionKind::Roadmap,
                format!("Reopened for regression found in {}", source_id),
            )
            .with_context(verdict.reason.clone()),
        )
    }

    /// Hand unread planner mail to the planner and apply what it returns
    async fn deliver_planner_messages(&mut self) -> Result<()> {
        let Some(planner) = self.agents.planner.clone() else {
            return Ok(());
        };
        let planner_name = self.config.planner_agent.clone();
        let inbox = self
            .manager
            .bus()
            .get_messages_for(&planner_name, &MessageFilter::default().unread())?;

        for message in inbox {
            match message.kind {
                MessageKind::ClarificationRequest => {
                    self.answer(planner.as_ref(), &planner_name, &message).await?;
                }
                MessageKind::Report | MessageKind::Suggestion => {
                    match planner.review_report(&message, self.manager.roadmap()).await {
                        Ok(commands) => {
                            for command in commands {
                                self.apply_command(command).await?;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(message_id = %message.id, error = %e, "Planner failed to review report");
                        }
                    }
                    self.manager.bus().mark_read(&message.id)?;
                }
                MessageKind::ClarificationResponse | MessageKind::AutoAdvanceRequest => {
                    self.manager.bus().mark_read(&message.id)?;
                }
            }
        }
        Ok(())
    }

    async fn answer(&self, planner: &dyn Planner, planner_name: &str, message: &Message) -> Result<()> {
        match planner.answer_clarification(message).await {
            Ok(Some(answer)) => {
                self.manager.bus().respond(
                    &message.id,
                    planner_name,
                    &format!("Re: {}", message.subject),
                    &answer,
                )?;
            }
            Ok(None) => self.manager.bus().mark_read(&message.id)?,
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "Planner failed to answer clarification");
                self.manager.bus().mark_read(&message.id)?;
            }
        }
        Ok(())
    }

    /// Apply one planner command; rejected commands are logged and skipped
    async fn apply_command(&mut self, command: RoadmapCommand) -> Result<()> {
        let actor = self.config.planner_agent.clone();
        let result = match &command {
            RoadmapCommand::Merge { ids, name, reason } => self
                .manager
                .merge_stages(ids, name, reason, &actor)
                .map(|_| ()),
            RoadmapCommand::Split { id, parts, reason } => self
                .manager
                .split_stage(id, parts, reason, &actor)
                .map(|_| ()),
            RoadmapCommand::Reorder { order, reason } => self
                .manager
                .reorder_stages(order, reason, &actor)
                .map(|_| ()),
            RoadmapCommand::Skip { id, reason } => {
                self.manager.skip_stage(id, reason, &actor).map(|_| ())
            }
        };

        match result {
            Ok(()) => {
                self.events
                    .emit(
                        WorkflowEvent::new(WorkflowEventKind::RoadmapChanged, &actor).with_data(
                            serde_json::json!({
                                "command": command,
                                "version": self.manager.roadmap().version,
                            }),
                        ),
                    )
                    .await;
                Ok(())
            }
            Err(e) if e.downcast_ref::<RoadmapError>().is_some() => {
                tracing::warn!(error = %e, "Planner command rejected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn export_report(&self, stage_id: &str) -> Result<()> {
        if !self.config.export_reports {
            return Ok(());
        }
        let dir = self
            .config
            .runtime_path()
            .join("reports")
            .join(self.manager.run_id());
        io::ensure_dir(&dir).await?;
        let report = self.manager.generate_stage_report(stage_id)?;
        let path = io::write_file(&dir, format!("{}.md", stage_id), &report).await?;
        tracing::debug!(stage_id = %stage_id, path = ?path, "Stage report exported");
        Ok(())
    }
}

/// Drain the command channel; an abort stays requested once seen
fn poll_abort(rx: &mut Option<mpsc::Receiver<WorkflowCommand>>, requested: &mut bool) -> bool {
    if !*requested {
        if let Some(rx) = rx {
            while let Ok(command) = rx.try_recv() {
                match command {
                    WorkflowCommand::Abort => *requested = true,
                }
            }
        }
    }
    *requested
}
