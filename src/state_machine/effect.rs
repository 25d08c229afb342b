//! Effects produced by state transitions

use crate::decoder::AgentEvent;
use crate::state_machine::state::{ContactMatch, Message, ToolCall, TurnErrorKind};
use std::time::Duration;

/// How a turn ended, as reported to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Answered {
        message: String,
        events: Vec<AgentEvent>,
    },
    Rejected {
        message: String,
    },
    AskUser {
        message: String,
        candidates: Vec<ContactMatch>,
    },
    Failed {
        message: String,
        kind: TurnErrorKind,
    },
}

/// Effects to be executed after state transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Persist the new state
    PersistState,

    /// Ask the validator for a verdict on the given dialogue
    RequestValidation { messages: Vec<Message> },

    /// Ask the agent for a completion, optionally offering tools
    RequestAgent {
        messages: Vec<Message>,
        bind_tools: bool,
    },

    /// Execute one tool call
    ExecuteTool { call: ToolCall },

    /// Stream a progress note to the caller
    EmitProgress { message: String },

    /// Stream the terminal event of the turn
    Finish(TurnOutcome),

    /// Schedule a retry
    ScheduleRetry { delay: Duration, attempt: u32 },
}

impl Effect {
    pub fn progress(message: impl Into<String>) -> Self {
        Effect::EmitProgress {
            message: message.into(),
        }
    }

    pub fn fail(kind: TurnErrorKind) -> Self {
        Effect::Finish(TurnOutcome::Failed {
            message: kind.user_message().to_string(),
            kind,
        })
    }
}
