//! Calendar tools exposed to the agent
//!
//! Tools are stateless; the calendar provider and cancellation signal come
//! in through `ToolContext` on every call.

mod contacts;
mod events;
mod free_time;

pub use contacts::FindSimilarContactsTool;
pub use events::{
    CreateEventTool, DeleteEventTool, EditEventTool, GetAllEventsTool, GetCalendarInvitationsTool,
};
pub use free_time::FindFreeTimeTool;

use crate::calendar::CalendarProvider;
use crate::llm::ToolDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    /// Machine-readable payload kept next to the text summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            structured: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            structured: None,
        }
    }

    pub fn with_structured(mut self, data: impl Serialize) -> Self {
        self.structured = serde_json::to_value(data).ok();
        self
    }
}

/// All context needed for a tool invocation.
///
/// Created fresh for each tool call; tools derive everything from it.
#[derive(Clone)]
pub struct ToolContext {
    /// Cancellation signal for long-running operations
    pub cancel: CancellationToken,

    /// The conversation this tool is executing within
    pub conversation_id: String,

    /// Reference instant for defaults such as "from now"
    pub now: DateTime<Utc>,

    calendar: Arc<dyn CalendarProvider>,
}

impl ToolContext {
    pub fn new(
        cancel: CancellationToken,
        conversation_id: String,
        calendar: Arc<dyn CalendarProvider>,
    ) -> Self {
        Self {
            cancel,
            conversation_id,
            now: Utc::now(),
            calendar,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn calendar(&self) -> &dyn CalendarProvider {
        self.calendar.as_ref()
    }
}

/// Trait for tools that can be executed by the agent
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool with all context provided via `ToolContext`
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// The closed set of tools the agent may be given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    CreateEvent,
    DeleteEvent,
    EditEvent,
    GetAllEvents,
    FindFreeTime,
    FindSimilarContacts,
    GetCalendarInvitations,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::CreateEvent,
        ToolKind::DeleteEvent,
        ToolKind::EditEvent,
        ToolKind::GetAllEvents,
        ToolKind::FindFreeTime,
        ToolKind::FindSimilarContacts,
        ToolKind::GetCalendarInvitations,
    ];

    /// Wire name seen by the model
    pub fn name(self) -> &'static str {
        match self {
            ToolKind::CreateEvent => "create_event_tool",
            ToolKind::DeleteEvent => "delete_event_tool",
            ToolKind::EditEvent => "edit_event_tool",
            ToolKind::GetAllEvents => "get_all_events_tool",
            ToolKind::FindFreeTime => "find_free_time_tool",
            ToolKind::FindSimilarContacts => "find_similar_contacts_tool",
            ToolKind::GetCalendarInvitations => "get_calendar_invitations_tool",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Note streamed to the user while the tool runs
    pub fn progress_label(self) -> &'static str {
        match self {
            ToolKind::CreateEvent => "Creating event...",
            ToolKind::DeleteEvent => "Deleting event...",
            ToolKind::EditEvent => "Updating event...",
            ToolKind::GetAllEvents => "Fetching events...",
            ToolKind::FindFreeTime => "Finding free time...",
            ToolKind::FindSimilarContacts => "Looking up contacts...",
            ToolKind::GetCalendarInvitations => "Checking invitations...",
        }
    }

    /// Parse a comma-separated list of tool names. `all` selects every tool.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, String> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("all") {
            return Ok(Self::ALL.to_vec());
        }

        let mut kinds = Vec::new();
        for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let kind = Self::from_name(name).ok_or_else(|| format!("unknown tool '{name}'"))?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    fn tool(self) -> Arc<dyn Tool> {
        match self {
            ToolKind::CreateEvent => Arc::new(CreateEventTool),
            ToolKind::DeleteEvent => Arc::new(DeleteEventTool),
            ToolKind::EditEvent => Arc::new(EditEventTool),
            ToolKind::GetAllEvents => Arc::new(GetAllEventsTool),
            ToolKind::FindFreeTime => Arc::new(FindFreeTimeTool),
            ToolKind::FindSimilarContacts => Arc::new(FindSimilarContactsTool),
            ToolKind::GetCalendarInvitations => Arc::new(GetCalendarInvitationsTool),
        }
    }
}

/// Tools bound to the agent for this deployment
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn from_kinds(kinds: &[ToolKind]) -> Self {
        Self {
            tools: kinds.iter().map(|k| k.tool()).collect(),
        }
    }

    #[cfg(test)]
    pub fn standard() -> Self {
        Self::from_kinds(&ToolKind::ALL)
    }

    /// Get all tool definitions for LLM
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name with context
    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput> {
        for tool in &self.tools {
            if tool.name() == name {
                return Some(tool.run(input, ctx).await);
            }
        }
        None
    }
}

/// Parse typed input, producing the error output the model sees on failure
pub(crate) fn parse_input<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, ToolOutput> {
    serde_json::from_value(input).map_err(|e| ToolOutput::error(format!("Invalid input: {e}")))
}
