//! # Workflow State
//!
//! The per-run record owned by the Workflow Manager: the current roadmap, every
//! earlier roadmap version, and the active stage pointer.

use super::db::StagehandDb;
use crate::roadmap::{Roadmap, StageId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// The machine-readable state of one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub run_id: String,
    /// Current roadmap (latest version, live statuses)
    pub roadmap: Roadmap,
    /// One snapshot per roadmap version, oldest first, current last
    pub history: Vec<Roadmap>,
    /// The single active stage, if any
    pub active_stage_id: Option<StageId>,
    /// Set when the run was aborted; the state stays resumable
    #[serde(default)]
    pub aborted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(roadmap: Roadmap) -> Self {
        let now = Utc::now();
        Self {
            run_id: roadmap.run_id.clone(),
            history: vec![roadmap.clone()],
            roadmap,
            active_stage_id: None,
            aborted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Install a new roadmap version and keep it in history
    pub(crate) fn push_version(&mut self, roadmap: Roadmap) {
        self.history.push(roadmap.clone());
        self.roadmap = roadmap;
        self.updated_at = Utc::now();
    }

    /// Look up a historical version
    pub fn version(&self, version: u32) -> Option<&Roadmap> {
        self.history.iter().find(|r| r.version == version)
    }
}

/// SQLite-backed persistence for workflow states
pub struct WorkflowStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl WorkflowStateStore {
    pub fn new(db: &StagehandDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Load the state of a run, if one was saved
    pub fn load(&self, run_id: &str) -> Result<Option<WorkflowState>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM workflow_states WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|d| serde_json::from_str(&d))
            .transpose()
            .with_context(|| format!("Corrupt workflow state for run {}", run_id))
    }

    /// Save (upsert) the state of a run
    pub fn save(&self, state: &WorkflowState) -> Result<()> {
        let data = serde_json::to_string(state)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT INTO workflow_states (run_id, data, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(run_id) DO UPDATE SET
                data = ?2,
                updated_at = ?3
            "#,
            params![state.run_id, data, state.updated_at.to_rfc3339()],
        )
        .context("Failed to save workflow state")?;

        Ok(())
    }

    /// List run ids, most recently updated first
    pub fn list_runs(&self) -> Result<Vec<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt =
            conn.prepare("SELECT run_id FROM workflow_states ORDER BY updated_at DESC")?;
        let runs = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to list runs")?;

        Ok(runs)
    }
}
