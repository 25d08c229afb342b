//! Database module
//!
//! Persists conversation state. Control fields live on the `conversations`
//! row; the validator and agent dialogues are append-only logs in `messages`.

mod schema;

pub use schema::*;

use crate::state_machine::state::{Message, TurnState};
use crate::state_machine::ConversationState;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("{channel} history of {id} would shrink from {stored} to {given} messages")]
    HistoryRewritten {
        id: String,
        channel: Channel,
        stored: usize,
        given: usize,
    },
    #[error("Database connection lock poisoned")]
    Poisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== State Operations ====================

    pub fn conversation_exists(&self, id: &str) -> DbResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Load the full state of a conversation
    pub fn load_state(&self, id: &str) -> DbResult<ConversationState> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT user_message, is_valid_input, response, tool_calls_remaining,
                        pending_contact_matches, turn
                 FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| DbError::ConversationNotFound(id.to_string()))?;

        let (user_message, is_valid_input, response, tool_calls_remaining, matches, turn) = row;
        Ok(ConversationState {
            user_message,
            validator_messages: load_channel(&conn, id, Channel::Validator)?,
            agent_messages: load_channel(&conn, id, Channel::Agent)?,
            is_valid_input,
            response,
            tool_calls_remaining,
            pending_contact_matches: serde_json::from_str(&matches)?,
            turn: serde_json::from_str(&turn)?,
        })
    }

    /// Persist a conversation atomically. Only messages beyond the stored
    /// length of each log are written.
    pub fn save_state(&self, id: &str, state: &ConversationState) -> DbResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO conversations (id, user_message, is_valid_input, response,
                 tool_calls_remaining, pending_contact_matches, turn, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 user_message = excluded.user_message,
                 is_valid_input = excluded.is_valid_input,
                 response = excluded.response,
                 tool_calls_remaining = excluded.tool_calls_remaining,
                 pending_contact_matches = excluded.pending_contact_matches,
                 turn = excluded.turn,
                 updated_at = excluded.updated_at",
            params![
                id,
                state.user_message,
                state.is_valid_input,
                state.response,
                state.tool_calls_remaining,
                serde_json::to_string(&state.pending_contact_matches)?,
                serde_json::to_string(&state.turn)?,
                now,
            ],
        )?;

        append_channel(&tx, id, Channel::Validator, &state.validator_messages, &now)?;
        append_channel(&tx, id, Channel::Agent, &state.agent_messages, &now)?;
        tx.commit()?;
        Ok(())
    }

    /// Control fields and log lengths, for status polling
    pub fn get_summary(&self, id: &str) -> DbResult<ConversationSummary> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.user_message, c.is_valid_input, c.response, c.tool_calls_remaining,
                    c.pending_contact_matches, c.turn, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id AND m.channel = 'validator'),
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id AND m.channel = 'agent')
             FROM conversations c WHERE c.id = ?1",
        )?;

        let row = stmt
            .query_row(params![id], |row| {
                let summary = ConversationSummary {
                    id: row.get(0)?,
                    user_message: row.get(1)?,
                    is_valid_input: row.get(2)?,
                    response: row.get(3)?,
                    tool_calls_remaining: row.get(4)?,
                    pending_contact_matches: Vec::new(),
                    turn: TurnState::default(),
                    created_at: parse_datetime(&row.get::<_, String>(7)?),
                    updated_at: parse_datetime(&row.get::<_, String>(8)?),
                    validator_messages: row.get(9)?,
                    agent_messages: row.get(10)?,
                };
                Ok((summary, row.get::<_, String>(5)?, row.get::<_, String>(6)?))
            })
            .optional()?
            .ok_or_else(|| DbError::ConversationNotFound(id.to_string()))?;

        let (mut summary, matches, turn) = row;
        summary.pending_contact_matches = serde_json::from_str(&matches)?;
        summary.turn = serde_json::from_str(&turn)?;
        Ok(summary)
    }

    /// Ids of conversations whose last turn never reached a terminal state
    pub fn list_in_flight(&self) -> DbResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM conversations
             WHERE json_extract(turn, '$.type') IN ('validating', 'agent_requesting', 'tool_loop')
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>().map_err(DbError::from)
    }
}

fn stored_len(tx: &Transaction<'_>, id: &str, channel: Channel) -> DbResult<usize> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND channel = ?2",
        params![id, channel.as_str()],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(count).unwrap_or_default())
}

fn append_channel(
    tx: &Transaction<'_>,
    id: &str,
    channel: Channel,
    messages: &[Message],
    now: &str,
) -> DbResult<()> {
    let stored = stored_len(tx, id, channel)?;
    if stored > messages.len() {
        return Err(DbError::HistoryRewritten {
            id: id.to_string(),
            channel,
            stored,
            given: messages.len(),
        });
    }

    let mut stmt = tx.prepare(
        "INSERT INTO messages (conversation_id, channel, sequence, role, body, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (sequence, message) in messages.iter().enumerate().skip(stored) {
        let role = serde_json::to_value(message.role)?;
        stmt.execute(params![
            id,
            channel.as_str(),
            i64::try_from(sequence).unwrap_or(i64::MAX),
            role.as_str().unwrap_or_default(),
            serde_json::to_string(message)?,
            now,
        ])?;
    }
    Ok(())
}

fn load_channel(conn: &Connection, id: &str, channel: Channel) -> DbResult<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT body FROM messages WHERE conversation_id = ?1 AND channel = ?2 ORDER BY sequence ASC",
    )?;
    let bodies = stmt
        .query_map(params![id, channel.as_str()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(DbError::from))
        .collect()
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
