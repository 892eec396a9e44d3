//! # Stagehand Database
//!
//! Single SQLite database holding every run's persisted state:
//! workflow state, stage memories, stage summaries and bus messages.
//! Documents are stored as JSON text keyed by run id (and stage id).

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::io;

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Database file name inside the runtime directory
pub const DB_FILE_NAME: &str = "stagehand.db";

/// Per-stage document tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTable {
    Memories,
    Summaries,
}

impl StageTable {
    fn name(&self) -> &'static str {
        match self {
            Self::Memories => "stage_memories",
            Self::Summaries => "stage_summaries",
        }
    }
}

/// Database manager shared by all stores of a process
pub struct StagehandDb {
    conn: Arc<Mutex<Connection>>,
}

impl StagehandDb {
    /// Open or create the database in the runtime directory
    pub fn open() -> Result<Self> {
        Self::open_at(io::get_runtime_path().join(DB_FILE_NAME))
    }

    /// Open database at a specific path (useful for testing)
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {:?}", parent)
            })?;
        }

        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open stagehand database: {:?}", path.as_ref()))?;

        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Run schema migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        Ok(())
    }

    /// Migration to version 1 - complete schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        // Workflow state (one JSON document per run)
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_states (
                run_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;

        for table in [StageTable::Memories, StageTable::Summaries] {
            conn.execute(
                &format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        run_id TEXT NOT NULL,
                        stage_id TEXT NOT NULL,
                        data TEXT NOT NULL,
                        updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                        PRIMARY KEY (run_id, stage_id)
                    )
                    "#,
                    table.name()
                ),
                [],
            )?;
        }

        // Inter-agent messages
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                run_id TEXT NOT NULL,
                from_agent TEXT NOT NULL,
                to_agent TEXT NOT NULL,
                kind TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                requires_response INTEGER NOT NULL DEFAULT 0,
                in_reply_to TEXT,
                read INTEGER NOT NULL DEFAULT 0,
                answered INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(run_id, to_agent)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_reply ON messages(in_reply_to)",
            [],
        )?;

        tracing::info!(
            "StagehandDb initialized with schema version {}",
            SCHEMA_VERSION
        );

        Ok(())
    }

    // =========================================================================
    // Stage Document Methods
    // =========================================================================

    /// Upsert a per-stage JSON document
    pub fn put_stage_doc<T: Serialize>(
        &self,
        table: StageTable,
        run_id: &str,
        stage_id: &str,
        doc: &T,
    ) -> Result<()> {
        let data = serde_json::to_string(doc)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            &format!(
                r#"
                INSERT INTO {} (run_id, stage_id, data, updated_at)
                VALUES (?1, ?2, ?3, datetime('now'))
                ON CONFLICT(run_id, stage_id) DO UPDATE SET
                    data = ?3,
                    updated_at = datetime('now')
                "#,
                table.name()
            ),
            params![run_id, stage_id, data],
        )
        .with_context(|| format!("Failed to save {} row for stage {}", table.name(), stage_id))?;

        Ok(())
    }

    /// Load a per-stage JSON document
    pub fn get_stage_doc<T: DeserializeOwned>(
        &self,
        table: StageTable,
        run_id: &str,
        stage_id: &str,
    ) -> Result<Option<T>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let data: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT data FROM {} WHERE run_id = ?1 AND stage_id = ?2",
                    table.name()
                ),
                params![run_id, stage_id],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|d| serde_json::from_str(&d))
            .transpose()
            .with_context(|| format!("Corrupt {} row for stage {}", table.name(), stage_id))
    }

    /// Load every per-stage document of a run
    pub fn list_stage_docs<T: DeserializeOwned>(
        &self,
        table: StageTable,
        run_id: &str,
    ) -> Result<Vec<T>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(&format!(
            "SELECT data FROM {} WHERE run_id = ?1 ORDER BY rowid",
            table.name()
        ))?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(serde_json::from_str(&row?)?);
        }
        Ok(docs)
    }
}
