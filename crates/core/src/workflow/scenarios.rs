//! End-to-end runs against scripted agents.

use super::agents::{AuditReport, BuildOutput, Builder, RoadmapCommand, StageContext};
use super::coordinator::{Coordinator, WorkflowCommand};
use super::cycle::{AuditFixController, LoopOutcome};
use super::events::{EventSink, WorkflowEventKind};
use super::manager::WorkflowManager;
use super::testing::{FailingRouter, ScriptedBuilder, ScriptedPlanner, ScriptedReviewer};
use super::Agents;
use crate::bus::{MessageFilter, MessageKind};
use crate::config::WorkflowConfig;
use crate::memory::{DecisionKind, Finding, Severity};
use crate::roadmap::StageStatus;
use crate::routing::StaticRouter;
use crate::state::StagehandDb;
use crate::summary::{CycleStatus, FileChange, StageOutcome};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

fn steps(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn start(db: &Arc<StagehandDb>, names: &[&str]) -> WorkflowManager {
    WorkflowManager::initialize(db.clone(), "run-1", steps(names), vec![], "planner").unwrap()
}

fn agents(config: &WorkflowConfig, builder: Arc<dyn Builder>, reviewer: Arc<ScriptedReviewer>) -> Agents {
    Agents::new(builder, reviewer, Arc::new(StaticRouter::from_config(config)))
}

fn finding(file: &str, description: &str) -> Finding {
    Finding::new(Severity::Error, "behavior", description).at(file, Some(12))
}

fn id_of(manager: &WorkflowManager, name: &str) -> String {
    manager.roadmap().find_by_name(name).unwrap().id.clone()
}

#[tokio::test]
async fn test_clean_run_auto_advances_every_stage() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let manager = start(&db, &["Layout", "Styling", "Interactivity"]);
    let reviewer = Arc::new(ScriptedReviewer::default());
    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), reviewer.clone());

    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();

    assert!(report.finished);
    assert!(!report.aborted);
    assert_eq!(report.roadmap_version, 1);
    assert_eq!(report.total_cycles, 3);
    assert_eq!(report.stages.len(), 3);
    assert!(report
        .stages
        .iter()
        .all(|s| s.outcome == Some(StageOutcome::AutoAdvanced)));

    let manager = coordinator.manager();
    for stage in manager.roadmap().stages() {
        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(stage.audit_count, 1);
        let summary = manager.get_stage_summary(&stage.id).unwrap();
        assert_eq!(summary.cycles.len(), 1);
        assert_eq!(summary.final_status, Some(StageOutcome::AutoAdvanced));
    }

    // each stage links back to the one completed before it
    let styling = id_of(manager, "Styling");
    let memory = manager.memory().load(&styling).unwrap().unwrap();
    assert_eq!(memory.previous_stage_id, Some(id_of(manager, "Layout")));

    let requests = manager
        .bus()
        .get_messages_for("orchestrator", &MessageFilter::default().kind(MessageKind::AutoAdvanceRequest))
        .unwrap();
    assert_eq!(requests.len(), 3);
    assert_eq!(reviewer.audit_count("Interactivity"), 1);
}

#[tokio::test]
async fn test_findings_are_fixed_then_stage_advances() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let manager = start(&db, &["Layout", "Styling", "Interactivity"]);
    let builder = Arc::new(ScriptedBuilder::default());
    let reviewer = Arc::new(ScriptedReviewer::default().then(
        "Interactivity",
        vec![
            finding("interactivity.js", "Menu does not close on escape"),
            finding("interactivity.js", "Focus is lost after submit"),
        ],
    ));
    let agents = agents(&config, builder.clone(), reviewer);

    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();
    assert!(report.finished);
    assert_eq!(report.roadmap_version, 1);
    assert_eq!(report.total_cycles, 4);

    let manager = coordinator.manager();
    let id = id_of(manager, "Interactivity");
    let summary = manager.get_stage_summary(&id).unwrap();
    assert_eq!(summary.cycles.len(), 2);
    assert_eq!(summary.cycles[0].status, CycleStatus::FixNeeded);
    assert_eq!(summary.cycles[0].finding_count, 2);
    assert_eq!(summary.cycles[1].status, CycleStatus::AutoAdvance);
    assert_eq!(summary.cycles[1].issues_addressed.len(), 2);
    assert_eq!(summary.open_issues().count(), 0);
    assert_eq!(summary.final_status, Some(StageOutcome::AutoAdvanced));

    // second build was handed both open findings
    let calls = builder.calls.lock().unwrap().clone();
    let interactivity: Vec<usize> = calls
        .iter()
        .filter(|(name, _)| name == "Interactivity")
        .map(|(_, open)| *open)
        .collect();
    assert_eq!(interactivity, vec![0, 2]);

    let memory = manager.memory().load(&id).unwrap().unwrap();
    assert!(memory.findings.iter().all(|f| f.resolved));
}

#[tokio::test]
async fn test_regression_reopens_earlier_stage() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let manager = start(&db, &["Layout", "Styling", "Checkout"]);
    let builder = Arc::new(
        ScriptedBuilder::default()
            .writes("Layout", &["index.html", "layout.css"])
            .writes("Checkout", &["checkout.html"]),
    );
    let reviewer = Arc::new(
        ScriptedReviewer::default().then("Checkout", vec![finding("./index.html", "Cart link points nowhere")]),
    );
    let agents = agents(&config, builder.clone(), reviewer);

    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();
    assert!(report.finished);
    assert_eq!(report.roadmap_version, 2);

    let order: Vec<(&str, Option<StageOutcome>)> = report
        .stages
        .iter()
        .map(|s| (s.stage_name.as_str(), s.outcome))
        .collect();
    assert_eq!(
        order,
        vec![
            ("Layout", Some(StageOutcome::AutoAdvanced)),
            ("Styling", Some(StageOutcome::AutoAdvanced)),
            ("Checkout", Some(StageOutcome::RegressionDeferred)),
            ("Layout", Some(StageOutcome::AutoAdvanced)),
            ("Checkout", Some(StageOutcome::AutoAdvanced)),
        ]
    );

    let manager = coordinator.manager();
    let layout_id = id_of(manager, "Layout");
    let checkout_id = id_of(manager, "Checkout");
    let layout = manager.stage(&layout_id).unwrap();
    assert_eq!(layout.status, StageStatus::Completed);
    assert_eq!(layout.reopen_count, 1);
    assert_eq!(layout.regression_source_id.as_deref(), Some(checkout_id.as_str()));

    let checkout = manager.get_stage_summary(&checkout_id).unwrap();
    assert!(checkout.regression_detected);
    assert_eq!(checkout.regression_target.as_deref(), Some(layout_id.as_str()));
    assert_eq!(checkout.cycles[0].status, CycleStatus::Regression);

    // the reopened stage was handed the finding that implicated it
    let layout_memory = manager.memory().load(&layout_id).unwrap().unwrap();
    assert!(layout_memory
        .findings
        .iter()
        .any(|f| f.file.as_deref() == Some("./index.html")));
    assert!(layout_memory
        .decisions
        .iter()
        .any(|d| d.kind == DecisionKind::Roadmap));
    let calls = builder.calls.lock().unwrap().clone();
    let layout_calls: Vec<usize> = calls
        .iter()
        .filter(|(name, _)| name == "Layout")
        .map(|(_, open)| *open)
        .collect();
    assert_eq!(layout_calls, vec![0, 1]);

    let entry = manager.change_log().last().unwrap();
    assert_eq!(entry.version, 2);
    assert_eq!(entry.actor, "orchestrator");

    let reports = manager
        .bus()
        .get_messages_for("planner", &MessageFilter::default().kind(MessageKind::Report))
        .unwrap();
    assert!(reports.iter().any(|m| m.subject == "Stage 'Layout' reopened"));
}

#[tokio::test]
async fn test_regression_past_reopen_limit_is_fixed_in_place() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig {
        max_reopens_per_stage: 0,
        ..WorkflowConfig::default()
    };
    let manager = start(&db, &["Layout", "Checkout"]);
    let builder = Arc::new(ScriptedBuilder::default().writes("Layout", &["index.html"]));
    let reviewer = Arc::new(
        ScriptedReviewer::default().then("Checkout", vec![finding("index.html", "Cart link points nowhere")]),
    );
    let agents = agents(&config, builder, reviewer);

    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();
    assert!(report.finished);
    assert_eq!(report.roadmap_version, 1);

    let manager = coordinator.manager();
    let checkout_id = id_of(manager, "Checkout");
    let summary = manager.get_stage_summary(&checkout_id).unwrap();
    assert_eq!(summary.cycles[0].status, CycleStatus::FixNeeded);
    assert_eq!(summary.final_status, Some(StageOutcome::AutoAdvanced));
    let memory = manager.memory().load(&checkout_id).unwrap().unwrap();
    assert!(memory.decisions.iter().any(|d| d.kind == DecisionKind::Verdict
        && d.description.contains("reopen limit")));
}

#[tokio::test]
async fn test_persistent_findings_exhaust_stage() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let manager = start(&db, &["Layout", "Forms"]);
    let stubborn = || vec![finding("forms.html", "Email field accepts anything")];
    let reviewer = Arc::new(
        ScriptedReviewer::default()
            .then("Forms", stubborn())
            .then("Forms", stubborn())
            .then("Forms", stubborn()),
    );
    let planner = Arc::new(ScriptedPlanner::default());
    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), reviewer.clone())
        .with_planner(planner.clone());

    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();
    assert!(report.finished);
    assert_eq!(report.stages[1].outcome, Some(StageOutcome::Exhausted));
    assert_eq!(reviewer.audit_count("Forms"), 3);

    let manager = coordinator.manager();
    let forms = id_of(manager, "Forms");
    let stage = manager.stage(&forms).unwrap();
    assert_eq!(stage.status, StageStatus::Completed);
    assert_eq!(stage.audit_count, 3);

    let summary = manager.get_stage_summary(&forms).unwrap();
    let statuses: Vec<CycleStatus> = summary.cycles.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![CycleStatus::FixNeeded, CycleStatus::FixNeeded, CycleStatus::Exhausted]
    );
    assert_eq!(summary.open_issues().count(), 1);

    let received = planner.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, MessageKind::Report);
    assert!(received[0].body.contains("Email field accepts anything"));
    assert_eq!(manager.bus().unread_count("planner").unwrap(), 0);
    assert!(report
        .events
        .iter()
        .any(|e| e.kind == WorkflowEventKind::StageExhausted));
}

#[tokio::test]
async fn test_deferred_stage_gets_fresh_audit_budget() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let manager = start(&db, &["Layout", "Checkout"]);
    let builder = Arc::new(ScriptedBuilder::default().writes("Layout", &["index.html"]));
    let stubborn = || vec![finding("checkout.html", "Total ignores shipping")];
    let reviewer = Arc::new(
        ScriptedReviewer::default()
            .then("Checkout", stubborn())
            .then("Checkout", stubborn())
            .then("Checkout", vec![finding("index.html", "Cart link points nowhere")])
            .then("Checkout", stubborn())
            .then("Checkout", stubborn())
            .then("Checkout", stubborn()),
    );
    let agents = agents(&config, builder, reviewer.clone());

    let mut coordinator = Coordinator::new(config.clone(), manager, agents);
    let report = coordinator.run().await.unwrap();
    assert!(report.finished);
    let outcomes: Vec<(&str, Option<StageOutcome>)> = report
        .stages
        .iter()
        .map(|s| (s.stage_name.as_str(), s.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("Layout", Some(StageOutcome::AutoAdvanced)),
            ("Checkout", Some(StageOutcome::RegressionDeferred)),
            ("Layout", Some(StageOutcome::AutoAdvanced)),
            ("Checkout", Some(StageOutcome::Exhausted)),
        ]
    );
    assert_eq!(reviewer.audit_count("Checkout"), 6);

    let manager = coordinator.manager();
    let checkout = id_of(manager, "Checkout");
    let stage = manager.stage(&checkout).unwrap();
    assert_eq!(stage.audit_count, config.max_audits);

    let summary = manager.get_stage_summary(&checkout).unwrap();
    assert_eq!(summary.current_activation_cycles().len() as u32, config.max_audits);
    let statuses: Vec<CycleStatus> = summary.cycles.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![
            CycleStatus::FixNeeded,
            CycleStatus::FixNeeded,
            CycleStatus::Regression,
            CycleStatus::FixNeeded,
            CycleStatus::FixNeeded,
            CycleStatus::Exhausted,
        ]
    );

    let reports = manager
        .bus()
        .get_messages_for("planner", &MessageFilter::default().kind(MessageKind::Report))
        .unwrap();
    let exhausted = reports
        .iter()
        .find(|m| m.subject == "Stage 'Checkout' exhausted its audits")
        .unwrap();
    assert!(exhausted.body.contains("reached 3 audits"));
}

#[tokio::test]
async fn test_replayed_cycle_does_not_duplicate_file_changes() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let mut manager = start(&db, &["Layout"]);
    let layout = id_of(&manager, "Layout");
    manager.start_stage(&layout).unwrap();

    // a crash after the build was logged, before the cycle was recorded
    manager
        .summaries()
        .record_file_changes(&layout, 1, &[FileChange::created("layout.html")])
        .unwrap();

    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), Arc::new(ScriptedReviewer::default()));
    let controller = AuditFixController::new(&config, &agents);
    let mut events = EventSink::default();
    let (cycle, _) = controller.run_cycle(&mut manager, &mut events, &layout).await.unwrap();
    assert_eq!(cycle.cycle_number, 1);
    assert_eq!(cycle.status, CycleStatus::AutoAdvance);

    let summary = manager.get_stage_summary(&layout).unwrap();
    assert_eq!(summary.file_changes.iter().filter(|r| r.cycle == 1).count(), 1);
    assert_eq!(summary.current_files(), vec!["layout.html".to_string()]);
    assert_eq!(manager.stage(&layout).unwrap().audit_count, 1);
}

#[tokio::test]
async fn test_recorded_cycle_counts_after_interruption() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let mut manager = start(&db, &["Forms"]);
    let forms = id_of(&manager, "Forms");
    manager.start_stage(&forms).unwrap();

    let stubborn = || vec![finding("forms.html", "Email field accepts anything")];
    let reviewer = Arc::new(
        ScriptedReviewer::default()
            .then("Forms", stubborn())
            .then("Forms", stubborn()),
    );
    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), reviewer);
    let controller = AuditFixController::new(&config, &agents);
    let mut events = EventSink::default();
    let (first, _) = controller.run_cycle(&mut manager, &mut events, &forms).await.unwrap();
    assert_eq!(first.status, CycleStatus::FixNeeded);
    assert_eq!(manager.stage(&forms).unwrap().audit_count, 1);

    // cycle 2 reached the summary but the stage count was never stored
    let mut second = first.clone();
    second.cycle_number = 2;
    manager.summaries().record_cycle(&forms, second).unwrap();
    drop(manager);

    let mut manager = WorkflowManager::load(db, "run-1").unwrap();
    assert_eq!(manager.stage(&forms).unwrap().audit_count, 1);
    let run = controller
        .run_stage(&mut manager, &mut events, &forms, || true)
        .await
        .unwrap();
    assert_eq!(run.outcome, LoopOutcome::Aborted);
    assert_eq!(manager.stage(&forms).unwrap().audit_count, 2);

    let (third, _) = controller.run_cycle(&mut manager, &mut events, &forms).await.unwrap();
    assert_eq!(third.cycle_number, 3);
    assert_eq!(third.status, CycleStatus::Exhausted);
    assert_eq!(manager.stage(&forms).unwrap().audit_count, config.max_audits);
}

#[tokio::test]
async fn test_planner_merge_keeps_originals_queryable() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let manager = start(&db, &["Layout", "Styling", "Forms", "Checkout"]);
    let styling = id_of(&manager, "Styling");
    let forms = id_of(&manager, "Forms");
    manager
        .bus()
        .send(
            "reviewer",
            "planner",
            MessageKind::Suggestion,
            "Styling and forms overlap",
            "Both stages edit the same form styles.",
            false,
        )
        .unwrap();

    let planner = Arc::new(ScriptedPlanner::default().responds_with(vec![RoadmapCommand::Merge {
        ids: vec![styling.clone(), forms.clone()],
        name: "Styling+Forms".to_string(),
        reason: "Shared stylesheet".to_string(),
    }]));
    let reviewer = Arc::new(ScriptedReviewer::default());
    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), reviewer)
        .with_planner(planner.clone());

    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();
    assert!(report.finished);
    assert_eq!(report.roadmap_version, 2);
    assert_eq!(report.stages.len(), 3);

    let manager = coordinator.manager();
    assert_eq!(manager.roadmap().len(), 3);
    let merged = manager.roadmap().find_by_name("Styling+Forms").unwrap();
    assert_eq!(merged.position, 1);
    assert_eq!(merged.status, StageStatus::Completed);
    assert_eq!(merged.plan_steps, vec![1, 2]);

    for original in [&styling, &forms] {
        let summary = manager.get_stage_summary(original).unwrap();
        assert_eq!(summary.superseded_by, vec![merged.id.clone()]);
    }
    let entry = manager.change_log().last().unwrap();
    assert_eq!(entry.actor, "planner");
    assert!(report
        .events
        .iter()
        .any(|e| e.kind == WorkflowEventKind::RoadmapChanged));
}

#[tokio::test]
async fn test_rejected_planner_command_is_skipped() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let manager = start(&db, &["Layout", "Styling"]);
    manager
        .bus()
        .send("reviewer", "planner", MessageKind::Suggestion, "Drop it", "", false)
        .unwrap();
    let planner = Arc::new(ScriptedPlanner::default().responds_with(vec![RoadmapCommand::Skip {
        id: "stage-99".to_string(),
        reason: "No such stage".to_string(),
    }]));
    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), Arc::new(ScriptedReviewer::default()))
        .with_planner(planner);

    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();
    assert!(report.finished);
    assert_eq!(report.roadmap_version, 1);
}

/// Builder that requests an abort the first time it builds `stage`
struct AbortingBuilder {
    inner: ScriptedBuilder,
    stage: String,
    tx: mpsc::Sender<WorkflowCommand>,
}

#[async_trait]
impl Builder for AbortingBuilder {
    async fn build(&self, ctx: &StageContext, unresolved: &[Finding]) -> Result<BuildOutput> {
        if ctx.stage.name == self.stage && ctx.cycle == 1 {
            let _ = self.tx.try_send(WorkflowCommand::Abort);
        }
        self.inner.build(ctx, unresolved).await
    }
}

#[tokio::test]
async fn test_abort_between_cycles_then_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stagehand.db");
    let config = WorkflowConfig::default();

    {
        let db = Arc::new(StagehandDb::open_at(&path).unwrap());
        let manager = start(&db, &["Layout", "Styling", "Forms"]);
        let (tx, rx) = mpsc::channel(4);
        let builder = Arc::new(AbortingBuilder {
            inner: ScriptedBuilder::default(),
            stage: "Styling".to_string(),
            tx,
        });
        let reviewer = Arc::new(
            ScriptedReviewer::default().then("Styling", vec![finding("styling.css", "Contrast too low")]),
        );
        let agents = agents(&config, builder, reviewer);

        let mut coordinator = Coordinator::new(config.clone(), manager, agents).with_command_channel(rx);
        let report = coordinator.run().await.unwrap();
        assert!(report.aborted);
        assert!(!report.finished);
        assert_eq!(report.stages.last().unwrap().outcome, None);
        assert!(report.events.iter().any(|e| e.kind == WorkflowEventKind::RunAborted));
    }

    let db = Arc::new(StagehandDb::open_at(&path).unwrap());
    let manager = WorkflowManager::load(db, "run-1").unwrap();
    assert!(manager.state().aborted);
    let styling = id_of(&manager, "Styling");
    assert_eq!(manager.get_active_stage().map(|s| s.id.clone()), Some(styling.clone()));

    let reviewer = Arc::new(ScriptedReviewer::default());
    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), reviewer);
    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();
    assert!(report.finished);
    assert!(!report.aborted);
    assert!(!coordinator.manager().state().aborted);

    let summary = coordinator.manager().get_stage_summary(&styling).unwrap();
    let numbers: Vec<u32> = summary.cycles.iter().map(|c| c.cycle_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(coordinator.manager().stage(&styling).unwrap().audit_count, 2);
}

#[tokio::test]
async fn test_resume_after_terminal_cycle_skips_agents() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let mut manager = start(&db, &["Layout"]);
    let layout = id_of(&manager, "Layout");
    manager.start_stage(&layout).unwrap();

    // crash after the clean cycle was recorded, before the stage completed
    let agents_first = agents(&config, Arc::new(ScriptedBuilder::default()), Arc::new(ScriptedReviewer::default()));
    let controller = AuditFixController::new(&config, &agents_first);
    let mut events = EventSink::default();
    controller.run_cycle(&mut manager, &mut events, &layout).await.unwrap();
    drop(manager);

    let manager = WorkflowManager::load(db, "run-1").unwrap();
    let builder = Arc::new(ScriptedBuilder::default());
    let reviewer = Arc::new(ScriptedReviewer::default());
    let agents = agents(&config, builder.clone(), reviewer.clone());
    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();

    assert!(report.finished);
    assert!(report.stages[0].resumed);
    assert_eq!(report.total_cycles, 0);
    assert_eq!(builder.call_count("Layout"), 0);
    assert_eq!(reviewer.audit_count("Layout"), 0);
    assert!(report.events.iter().any(|e| e.kind == WorkflowEventKind::StageResumed));
}

#[tokio::test]
async fn test_failing_builder_degrades_until_exhausted() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let manager = start(&db, &["Layout", "Styling"]);
    let builder = Arc::new(ScriptedBuilder::default().failing("Layout", 3));
    let reviewer = Arc::new(ScriptedReviewer::default());
    let agents = agents(&config, builder, reviewer.clone());

    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();
    assert!(report.finished);
    assert_eq!(report.stages[0].outcome, Some(StageOutcome::Exhausted));
    assert_eq!(report.stages[1].outcome, Some(StageOutcome::AutoAdvanced));
    assert_eq!(reviewer.audit_count("Layout"), 0);

    let layout = id_of(coordinator.manager(), "Layout");
    let summary = coordinator.manager().get_stage_summary(&layout).unwrap();
    assert_eq!(summary.cycles.len(), 3);
    assert!(summary.cycles.iter().all(|c| c.degraded));
    assert!(summary.cycles[0]
        .note
        .as_deref()
        .unwrap()
        .contains("builder timed out"));

    let reports = coordinator
        .manager()
        .bus()
        .get_messages_for("planner", &MessageFilter::default().kind(MessageKind::Report))
        .unwrap();
    let exhausted = reports
        .iter()
        .find(|m| m.subject == "Stage 'Layout' exhausted its audits")
        .unwrap();
    assert!(exhausted.body.contains("last cycle degraded: Builder failed: builder timed out"));
    assert_eq!(
        report
            .events
            .iter()
            .filter(|e| e.kind == WorkflowEventKind::AgentFailed)
            .count(),
        3
    );
}

#[tokio::test]
async fn test_router_failure_degrades_cycle() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig {
        max_audits: 1,
        ..WorkflowConfig::default()
    };
    let manager = start(&db, &["Layout"]);
    let builder = Arc::new(ScriptedBuilder::default());
    let agents = Agents::new(builder.clone(), Arc::new(ScriptedReviewer::default()), Arc::new(FailingRouter));

    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();
    assert_eq!(report.stages[0].outcome, Some(StageOutcome::Exhausted));
    assert_eq!(builder.call_count("Layout"), 0);
}

#[tokio::test]
async fn test_clarification_answer_reaches_next_cycle() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let mut manager = start(&db, &["Styling"]);
    let styling = id_of(&manager, "Styling");
    manager.start_stage(&styling).unwrap();

    let reviewer = Arc::new(ScriptedReviewer::default().then_report(
        "Styling",
        AuditReport {
            findings: vec![finding("styling.css", "Breakpoint missing")],
            clarifications: vec!["Which tablet breakpoint should be used?".to_string()],
            cost_usd: 0.0,
        },
    ));
    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), reviewer);
    let controller = AuditFixController::new(&config, &agents);
    let mut events = EventSink::default();

    let (first, _) = controller.run_cycle(&mut manager, &mut events, &styling).await.unwrap();
    assert_eq!(first.status, CycleStatus::FixNeeded);

    let pending = manager.bus().pending_requests(Some("planner")).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, MessageKind::ClarificationRequest);
    manager
        .bus()
        .respond(&pending[0].id, "planner", "Re: breakpoint", "768px")
        .unwrap();

    let (second, _) = controller.run_cycle(&mut manager, &mut events, &styling).await.unwrap();
    assert_eq!(second.status, CycleStatus::AutoAdvance);
    let memory = manager.memory().load(&styling).unwrap().unwrap();
    assert_eq!(memory.clarifications[0].answer.as_deref(), Some("768px"));
    assert!(manager.bus().pending_requests(Some("planner")).unwrap().is_empty());
}

#[tokio::test]
async fn test_planner_answers_clarification_during_run() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let manager = start(&db, &["Styling", "Forms"]);
    let reviewer = Arc::new(ScriptedReviewer::default().then_report(
        "Styling",
        AuditReport {
            findings: Vec::new(),
            clarifications: vec!["Dark mode in scope?".to_string()],
            cost_usd: 0.0,
        },
    ));
    let planner = Arc::new(ScriptedPlanner::default().answers("Not for this release"));
    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), reviewer).with_planner(planner.clone());

    let mut coordinator = Coordinator::new(config, manager, agents);
    let report = coordinator.run().await.unwrap();
    assert!(report.finished);

    let received = planner.received();
    let request = received
        .iter()
        .find(|m| m.kind == MessageKind::ClarificationRequest)
        .unwrap();
    let bus = coordinator.manager().bus();
    let response = bus.get_response(&request.id).unwrap().unwrap();
    assert_eq!(response.body, "Not for this release");
    assert_eq!(response.kind, MessageKind::ClarificationResponse);
    assert!(bus.pending_requests(Some("planner")).unwrap().is_empty());
}

#[tokio::test]
async fn test_reports_exported_per_finished_stage() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig {
        export_reports: true,
        runtime_path: Some(dir.path().to_path_buf()),
        ..WorkflowConfig::default()
    };
    let manager = start(&db, &["Layout", "Styling"]);
    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), Arc::new(ScriptedReviewer::default()));

    let mut coordinator = Coordinator::new(config, manager, agents);
    coordinator.run().await.unwrap();

    let manager = coordinator.manager();
    for stage in manager.roadmap().stages() {
        let path = dir
            .path()
            .join("reports")
            .join("run-1")
            .join(format!("{}.md", stage.id));
        let report = std::fs::read_to_string(&path).unwrap();
        assert!(report.contains(&stage.name));
    }
}

#[tokio::test]
async fn test_events_stream_to_channel() {
    let db = Arc::new(StagehandDb::open_in_memory().unwrap());
    let config = WorkflowConfig::default();
    let manager = start(&db, &["Layout"]);
    let agents = agents(&config, Arc::new(ScriptedBuilder::default()), Arc::new(ScriptedReviewer::default()));
    let (tx, mut rx) = mpsc::channel(64);

    let mut coordinator = Coordinator::new(config, manager, agents).with_event_channel(tx);
    let report = coordinator.run().await.unwrap();

    let mut streamed = Vec::new();
    while let Ok(event) = rx.try_recv() {
        streamed.push(event.kind);
    }
    assert_eq!(streamed.first(), Some(&WorkflowEventKind::RunStarted));
    assert_eq!(streamed.last(), Some(&WorkflowEventKind::RunCompleted));
    assert_eq!(streamed.len(), report.events.len());
}
