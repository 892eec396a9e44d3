//! # Workflow Events
//!
//! Observer stream of what a run is doing. Events are informational; the
//! durable record lives in the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Kind of workflow event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    RunStarted,
    StageStarted,
    /// A build→audit cycle began
    CycleStarted,
    /// A cycle was durably recorded
    CycleRecorded,
    /// Builder, reviewer or router call failed
    AgentFailed,
    StageAutoAdvanced,
    /// Stage completed with findings remaining
    StageExhausted,
    RegressionDetected,
    StageReopened,
    /// Active stage returned to pending
    StageDeferred,
    /// Resumed stage already had a terminal cycle
    StageResumed,
    /// Planner changed the roadmap
    RoadmapChanged,
    MessageSent,
    RunCompleted,
    RunAborted,
}

/// An event in the workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: WorkflowEventKind,
    /// Agent or component that produced this event
    pub agent: String,
    #[serde(default)]
    pub stage_id: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl WorkflowEvent {
    pub fn new(kind: WorkflowEventKind, agent: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            agent: agent.to_string(),
            stage_id: None,
            data: None,
        }
    }

    pub fn with_stage(mut self, stage_id: &str) -> Self {
        self.stage_id = Some(stage_id.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Keeps every emitted event and forwards it to an optional channel
#[derive(Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<WorkflowEvent>>,
    log: Vec<WorkflowEvent>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::Sender<WorkflowEvent>>) -> Self {
        Self { tx, log: Vec::new() }
    }

    pub async fn emit(&mut self, event: WorkflowEvent) {
        self.log.push(event.clone());
        if let Some(tx) = &self.tx {
            // a dropped observer must not stop the run
            let _ = tx.send(event).await;
        }
    }

    pub fn events(&self) -> &[WorkflowEvent] {
        &self.log
    }

    pub fn take(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.log)
    }
}
