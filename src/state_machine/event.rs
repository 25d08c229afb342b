//! Events that can occur during a turn

use crate::llm::LlmErrorKind;
use crate::state_machine::state::{ToolCall, ToolResult};
use std::time::Duration;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // User events
    UserMessage {
        text: String,
    },

    // LLM events
    ValidatorResponse {
        text: String,
    },
    AgentResponse {
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    LlmError {
        message: String,
        kind: LlmErrorKind,
        attempt: u32,
        retry_after: Option<Duration>,
    },
    RetryTimeout {
        attempt: u32,
    },

    // Tool events
    ToolComplete {
        tool_call_id: String,
        result: ToolResult,
    },
}
