//! Conversation recovery logic
//!
//! A persisted state can be caught mid-turn when the process stopped while an
//! LLM call or tool was in flight. Such a state is repaired before the next
//! message is applied so that the histories stay well formed and no tool is
//! dispatched twice.

use crate::state_machine::state::{Message, Role, ToolResult, TurnErrorKind};
use crate::state_machine::{ConversationState, TurnState};
use std::collections::HashSet;

/// Tool result recorded for calls that never reported back
pub const INTERRUPTED_TOOL_OUTPUT: &str = "[Tool execution interrupted before completion]";

/// Result of inspecting a loaded state
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryDecision {
    /// The state to continue from
    pub state: ConversationState,
    /// Whether the state was changed and should be persisted
    pub repaired: bool,
    /// Reason for the decision (for logging)
    pub reason: RecoveryReason,
}

/// Why we made a particular recovery decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryReason {
    /// No turn was in flight
    NotInFlight,
    /// Stopped while waiting for the validator
    InterruptedValidation,
    /// Stopped while waiting for the agent
    InterruptedAgentStep,
    /// Stopped inside a tool batch; `synthesized` calls got an error result
    InterruptedToolLoop { synthesized: usize },
}

impl RecoveryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInFlight => "not_in_flight",
            Self::InterruptedValidation => "interrupted_validation",
            Self::InterruptedAgentStep => "interrupted_agent_step",
            Self::InterruptedToolLoop { .. } => "interrupted_tool_loop",
        }
    }
}

fn interrupted(mut state: ConversationState, reason: RecoveryReason) -> RecoveryDecision {
    state.turn = TurnState::Failed {
        message: TurnErrorKind::Interrupted.user_message().to_string(),
        kind: TurnErrorKind::Interrupted,
    };
    RecoveryDecision {
        state,
        repaired: true,
        reason,
    }
}

/// Repair a state whose turn was left in flight.
///
/// Pending messages of the validation and agent steps were never committed,
/// so they are simply dropped. Inside a tool loop, every call of the last
/// assistant batch that has no result gets [`INTERRUPTED_TOOL_OUTPUT`], in
/// call order. Suspended conversations are left alone.
pub fn repair_interrupted(state: ConversationState) -> RecoveryDecision {
    match state.turn {
        TurnState::Validating { .. } => interrupted(state, RecoveryReason::InterruptedValidation),
        TurnState::AgentRequesting { .. } => {
            interrupted(state, RecoveryReason::InterruptedAgentStep)
        }
        TurnState::ToolLoop { .. } => {
            let mut state = state;
            let synthesized = close_open_batch(&mut state.agent_messages);
            interrupted(state, RecoveryReason::InterruptedToolLoop { synthesized })
        }
        _ => RecoveryDecision {
            state,
            repaired: false,
            reason: RecoveryReason::NotInFlight,
        },
    }
}

/// Append error results for the unanswered calls of the last assistant
/// batch. Returns how many were added.
fn close_open_batch(messages: &mut Vec<Message>) -> usize {
    let Some(batch_at) = messages
        .iter()
        .rposition(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
    else {
        return 0;
    };

    let answered: HashSet<&str> = messages
        .iter()
        .skip(batch_at + 1)
        .filter(|m| m.role == Role::ToolResult)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    let missing: Vec<Message> = messages
        .get(batch_at)
        .map(|batch| batch.tool_calls.as_slice())
        .unwrap_or_default()
        .iter()
        .filter(|call| !answered.contains(call.id.as_str()))
        .map(|call| Message::tool_result(&ToolResult::error(&call.id, INTERRUPTED_TOOL_OUTPUT)))
        .collect();

    let count = missing.len();
    messages.extend(missing);
    count
}
