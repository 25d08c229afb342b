//! Conversation state types

use crate::tools::ToolKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

// ============================================================================
// Messages
// ============================================================================

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// Message body: plain text or a structured payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Structured(Value),
}

impl MessageContent {
    /// Render for a text-only channel
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Structured(value) => value.to_string(),
        }
    }
}

/// A tool invocation requested by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

impl ToolResult {
    pub fn error(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            output: message.into(),
            structured: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    fn new(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, MessageContent::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(text.into()))
    }

    pub fn assistant_with_tools(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::assistant(text)
        }
    }

    /// Tool-result message. Structured payloads are kept next to the summary text.
    pub fn tool_result(result: &ToolResult) -> Self {
        let content = match &result.structured {
            Some(data) => MessageContent::Structured(serde_json::json!({
                "summary": result.output,
                "data": data,
            })),
            None => MessageContent::Text(result.output.clone()),
        };
        Self {
            tool_call_id: Some(result.tool_call_id.clone()),
            is_error: !result.success,
            ..Self::new(Role::ToolResult, content)
        }
    }
}

/// Candidate contact for a name the user mentioned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactMatch {
    pub display_name: String,
    pub address: String,
    /// Similarity in [0, 1]
    pub score: f64,
}

// ============================================================================
// Turn state
// ============================================================================

/// Machine-readable classification of a failed turn, used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnErrorKind {
    /// Validator output could not be decoded
    ValidationDecode,
    /// Validator LLM call failed or timed out
    ValidationFailed,
    /// Agent LLM call failed or timed out
    AgentFailed,
    /// Model named a tool outside the bound set
    UnknownTool,
    /// Conversation state could not be loaded
    StoreUnavailable,
    /// The process stopped while the turn was in flight
    Interrupted,
    Internal,
}

impl TurnErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationDecode => "validation_decode",
            Self::ValidationFailed => "validation_failed",
            Self::AgentFailed => "agent_failed",
            Self::UnknownTool => "unknown_tool",
            Self::StoreUnavailable => "store_unavailable",
            Self::Interrupted => "interrupted",
            Self::Internal => "internal",
        }
    }

    /// Text shown to the caller for this failure
    pub fn user_message(self) -> &'static str {
        match self {
            Self::ValidationDecode => "Sorry, I could not process your message.",
            Self::ValidationFailed | Self::AgentFailed => {
                "Sorry, the assistant is unavailable right now. Please try again."
            }
            Self::StoreUnavailable => "Conversation storage is unavailable. Please try again.",
            Self::UnknownTool | Self::Interrupted | Self::Internal => {
                "Sorry, something went wrong while handling your message."
            }
        }
    }
}

/// Named suspension points from which a turn resumes with new user input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Checkpoint {
    /// Contact lookup found several candidates; the user picks one
    ContactChoice {
        call: ToolCall,
        /// Result of the lookup, appended once the user has chosen
        result: ToolResult,
        /// Calls of the same batch that have not run yet
        remaining: Vec<ToolCall>,
    },
}

/// Where the conversation is within its current turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnState {
    /// No turn has run yet
    #[default]
    Start,

    /// Waiting for the validator verdict
    Validating {
        attempt: u32,
        /// Human turn (and first-time system prompt) committed with the verdict
        pending: Vec<Message>,
    },

    /// Validator rejected the last message
    Rejected,

    /// Waiting for an agent completion
    AgentRequesting {
        attempt: u32,
        pending: Vec<Message>,
        tools_bound: bool,
    },

    /// Executing the tool calls of one batch, in order
    ToolLoop {
        current: ToolCall,
        remaining: Vec<ToolCall>,
    },

    /// Paused for human input
    Suspended { checkpoint: Checkpoint },

    /// Last turn completed normally
    Done,

    /// Last turn aborted
    Failed {
        message: String,
        kind: TurnErrorKind,
    },
}

impl TurnState {
    /// A turn is in flight and must not accept a new message
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            TurnState::Validating { .. }
                | TurnState::AgentRequesting { .. }
                | TurnState::ToolLoop { .. }
        )
    }

    #[cfg(test)]
    pub fn is_suspended(&self) -> bool {
        matches!(self, TurnState::Suspended { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            TurnState::Start => "start",
            TurnState::Validating { .. } => "validating",
            TurnState::Rejected => "rejected",
            TurnState::AgentRequesting { .. } => "agent_requesting",
            TurnState::ToolLoop { .. } => "tool_loop",
            TurnState::Suspended { .. } => "suspended",
            TurnState::Done => "done",
            TurnState::Failed { .. } => "failed",
        }
    }
}

/// Everything persisted for one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub user_message: String,
    pub validator_messages: Vec<Message>,
    pub agent_messages: Vec<Message>,
    pub is_valid_input: bool,
    pub response: Option<String>,
    pub tool_calls_remaining: u32,
    pub pending_contact_matches: Vec<ContactMatch>,
    pub turn: TurnState,
}

impl ConversationState {
    pub fn new(tool_budget: u32) -> Self {
        Self {
            user_message: String::new(),
            validator_messages: Vec::new(),
            agent_messages: Vec::new(),
            is_valid_input: true,
            response: None,
            tool_calls_remaining: tool_budget,
            pending_contact_matches: Vec::new(),
            turn: TurnState::Start,
        }
    }
}

// ============================================================================
// Turn context
// ============================================================================

/// How the tool budget is charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetMode {
    /// One unit per completion that requests tools
    #[default]
    PerBatch,
    /// One unit per requested tool call
    PerCall,
}

/// How much validator history is re-sent with each validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorWindow {
    Full,
    /// Last N user/assistant exchanges
    LastExchanges(usize),
}

impl Default for ValidatorWindow {
    fn default() -> Self {
        ValidatorWindow::LastExchanges(1)
    }
}

/// Deployment-time knobs that shape every turn
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub validator_enabled: bool,
    pub tool_budget: u32,
    pub budget_mode: BudgetMode,
    pub validator_window: ValidatorWindow,
    pub contact_disambiguation: bool,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub tools: Vec<ToolKind>,
    pub timezone: String,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            validator_enabled: true,
            tool_budget: 5,
            budget_mode: BudgetMode::PerBatch,
            validator_window: ValidatorWindow::default(),
            contact_disambiguation: true,
            max_attempts: 3,
            retry_base: Duration::from_secs(1),
            tools: ToolKind::ALL.to_vec(),
            timezone: "UTC".to_string(),
        }
    }
}

/// Immutable inputs of one turn
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub conversation_id: String,
    pub settings: TurnSettings,
    /// Date substituted into the agent prompt
    pub today: String,
}

impl TurnContext {
    pub fn new(
        conversation_id: impl Into<String>,
        settings: TurnSettings,
        today: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            settings,
            today: today.into(),
        }
    }

    pub fn is_bound(&self, tool_name: &str) -> bool {
        self.settings.tools.iter().any(|k| k.name() == tool_name)
    }
}
