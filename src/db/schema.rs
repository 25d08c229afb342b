//! Database schema and types

use crate::state_machine::state::{ContactMatch, TurnState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_message TEXT NOT NULL DEFAULT '',
    is_valid_input BOOLEAN NOT NULL DEFAULT 1,
    response TEXT,
    tool_calls_remaining INTEGER NOT NULL,
    pending_contact_matches TEXT NOT NULL DEFAULT '[]',
    turn TEXT NOT NULL DEFAULT '{"type":"start"}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    conversation_id TEXT NOT NULL,
    channel TEXT NOT NULL CHECK (channel IN ('validator', 'agent')),
    sequence INTEGER NOT NULL,
    role TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (conversation_id, channel, sequence),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
"#;

/// Which of the two dialogue logs a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Validator,
    Agent,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Validator, Channel::Agent];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Validator => "validator",
            Channel::Agent => "agent",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted view of a conversation without its message bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub user_message: String,
    pub is_valid_input: bool,
    pub response: Option<String>,
    pub tool_calls_remaining: u32,
    pub pending_contact_matches: Vec<ContactMatch>,
    pub turn: TurnState,
    pub validator_messages: u64,
    pub agent_messages: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
