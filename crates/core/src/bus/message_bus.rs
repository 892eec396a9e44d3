//! # Message Bus
//!
//! Persistent relay between agent roles. Sending is bookkeeping, not delivery:
//! every agent polls `get_messages_for(self)`. A response is a new message
//! linked through `in_reply_to`; the original is only flagged answered.

use super::message::{Message, MessageFilter, MessageKind};
use crate::state::StagehandDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

const SELECT_COLUMNS: &str = r#"
    SELECT id, run_id, from_agent, to_agent, kind, subject, body,
           requires_response, in_reply_to, read, answered, created_at
    FROM messages
"#;

/// SQLite-backed message bus scoped to one run
#[derive(Clone)]
pub struct MessageBus {
    conn: Arc<Mutex<Connection>>,
    run_id: String,
}

impl MessageBus {
    pub fn new(db: &StagehandDb, run_id: &str) -> Self {
        Self {
            conn: db.connection(),
            run_id: run_id.to_string(),
        }
    }

    /// Store a message and return its id
    pub fn send(
        &self,
        from: &str,
        to: &str,
        kind: MessageKind,
        subject: &str,
        body: &str,
        requires_response: bool,
    ) -> Result<String> {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: self.run_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            kind,
            subject: subject.to_string(),
            body: body.to_string(),
            requires_response,
            in_reply_to: None,
            read: false,
            answered: false,
            created_at: Utc::now(),
        };

        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        Self::insert(&conn, &message).context("Failed to send message")?;

        tracing::debug!(
            message_id = %message.id,
            from = %from,
            to = %to,
            kind = %kind,
            "Message sent"
        );
        Ok(message.id)
    }

    /// Reply to a message; the reply goes back to the original sender
    pub fn respond(&self, original_id: &str, from: &str, subject: &str, body: &str) -> Result<String> {
        let original = self
            .get_message(original_id)?
            .with_context(|| format!("Message not found: {}", original_id))?;

        let reply = Message {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: self.run_id.clone(),
            from: from.to_string(),
            to: original.from.clone(),
            kind: original.kind.response_kind(),
            subject: subject.to_string(),
            body: body.to_string(),
            requires_response: false,
            in_reply_to: Some(original.id.clone()),
            read: false,
            answered: false,
            created_at: Utc::now(),
        };

        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let tx = conn.transaction()?;
        Self::insert(&tx, &reply)?;
        tx.execute(
            "UPDATE messages SET answered = 1, read = 1 WHERE id = ?1",
            params![original.id],
        )?;
        tx.commit().context("Failed to record response")?;

        Ok(reply.id)
    }

    /// Messages addressed to `agent`, oldest first
    pub fn get_messages_for(&self, agent: &str, filter: &MessageFilter) -> Result<Vec<Message>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let sql = format!(
            r#"{}
            WHERE run_id = ?1 AND to_agent = ?2
              AND (?3 IS NULL OR kind = ?3)
              AND (?4 IS NULL OR from_agent = ?4)
              AND (?5 = 0 OR read = 0)
            ORDER BY seq
            "#,
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(
                params![
                    self.run_id,
                    agent,
                    filter.kind.map(|k| k.as_str()),
                    filter.from,
                    filter.unread_only as i32,
                ],
                Self::row_to_message,
            )?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list messages")?;

        Ok(messages)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let message = conn
            .query_row(
                &format!("{} WHERE id = ?1 AND run_id = ?2", SELECT_COLUMNS),
                params![id, self.run_id],
                Self::row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// First reply to a message, if any
    pub fn get_response(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.replies(id)?.into_iter().next())
    }

    /// A message followed by every reply to it
    pub fn thread(&self, id: &str) -> Result<Vec<Message>> {
        let mut thread = Vec::new();
        if let Some(root) = self.get_message(id)? {
            thread.push(root);
            thread.extend(self.replies(id)?);
        }
        Ok(thread)
    }

    pub fn mark_read(&self, id: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let affected = conn.execute(
            "UPDATE messages SET read = 1 WHERE id = ?1 AND run_id = ?2",
            params![id, self.run_id],
        )?;
        if affected == 0 {
            anyhow::bail!("Message not found: {}", id);
        }
        Ok(())
    }

    /// Requests still waiting for an answer, optionally only those to `to`
    pub fn pending_requests(&self, to: Option<&str>) -> Result<Vec<Message>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(&format!(
            r#"{}
            WHERE run_id = ?1 AND requires_response = 1 AND answered = 0
              AND (?2 IS NULL OR to_agent = ?2)
            ORDER BY seq
            "#,
            SELECT_COLUMNS
        ))?;
        let messages = stmt
            .query_map(params![self.run_id, to], Self::row_to_message)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list pending requests")?;
        Ok(messages)
    }

    pub fn unread_count(&self, agent: &str) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE run_id = ?1 AND to_agent = ?2 AND read = 0",
            params![self.run_id, agent],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn replies(&self, id: &str) -> Result<Vec<Message>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE in_reply_to = ?1 AND run_id = ?2 ORDER BY seq",
            SELECT_COLUMNS
        ))?;
        let replies = stmt
            .query_map(params![id, self.run_id], Self::row_to_message)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list replies")?;
        Ok(replies)
    }

    fn insert(conn: &Connection, message: &Message) -> rusqlite::Result<usize> {
        conn.execute(
            r#"
            INSERT INTO messages
            (id, run_id, from_agent, to_agent, kind, subject, body,
             requires_response, in_reply_to, read, answered, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                message.id,
                message.run_id,
                message.from,
                message.to,
                message.kind.as_str(),
                message.subject,
                message.body,
                message.requires_response as i32,
                message.in_reply_to,
                message.read as i32,
                message.answered as i32,
                message.created_at.to_rfc3339(),
            ],
        )
    }

    fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
        let created_at_str: String = row.get(11)?;
        let kind_str: String = row.get(4)?;
        let kind = MessageKind::from_str(&kind_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("Unknown message kind: {}", kind_str).into(),
            )
        })?;

        Ok(Message {
            id: row.get(0)?,
            run_id: row.get(1)?,
            from: row.get(2)?,
            to: row.get(3)?,
            kind,
            subject: row.get(5)?,
            body: row.get(6)?,
            requires_response: row.get::<_, i32>(7)? != 0,
            in_reply_to: row.get(8)?,
            read: row.get::<_, i32>(9)? != 0,
            answered: row.get::<_, i32>(10)? != 0,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}
