//! Event tools: create, delete, edit, list and pending invitations

use super::{parse_input, Tool, ToolContext, ToolOutput};
use crate::calendar::{parse_timestamp, CalendarEvent, EventChanges, EventQuery, NewEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

const MAX_LIMIT: u32 = 250;

fn primary() -> String {
    "primary".to_string()
}

fn default_limit() -> u32 {
    10
}

fn calendar_error(e: &impl std::fmt::Display) -> ToolOutput {
    ToolOutput::error(format!("Calendar error: {e}"))
}

fn parse_bound(field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, ToolOutput> {
    value
        .map(|v| parse_timestamp(field, v).map(|t| t.with_timezone(&Utc)))
        .transpose()
        .map_err(ToolOutput::error)
}

fn list_output(events: &[CalendarEvent], empty: &str) -> ToolOutput {
    if events.is_empty() {
        return ToolOutput::success(empty).with_structured(events);
    }
    let lines: Vec<String> = events.iter().map(CalendarEvent::line).collect();
    ToolOutput::success(lines.join("\n")).with_structured(events)
}

// ============================================================================
// create_event_tool
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateEventInput {
    summary: String,
    start: String,
    end: String,
    #[serde(default = "primary")]
    calendar_id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    color_id: Option<String>,
    #[serde(default)]
    attendees: Vec<String>,
    #[serde(default)]
    recurrence: Vec<String>,
}

impl CreateEventInput {
    fn into_event(self) -> Result<(String, NewEvent), String> {
        let start = parse_timestamp("start", &self.start)?;
        let end = parse_timestamp("end", &self.end)?;
        if start >= end {
            return Err("start must be before end".to_string());
        }
        if let Some(bad) = self.attendees.iter().find(|a| !a.contains('@')) {
            return Err(format!("invalid attendee address '{bad}'"));
        }
        Ok((
            self.calendar_id,
            NewEvent {
                summary: self.summary,
                start,
                end,
                description: self.description,
                location: self.location,
                color_id: self.color_id,
                attendees: self.attendees,
                recurrence: self.recurrence,
            },
        ))
    }
}

pub struct CreateEventTool;

#[async_trait]
impl Tool for CreateEventTool {
    fn name(&self) -> &'static str {
        "create_event_tool"
    }

    fn description(&self) -> String {
        "Create a calendar event. Times are RFC 3339 with an offset. Attendees are invited by email address and notified.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["summary", "start", "end"],
            "properties": {
                "summary": {"type": "string", "description": "Event title"},
                "start": {"type": "string", "description": "Start time, RFC 3339"},
                "end": {"type": "string", "description": "End time, RFC 3339"},
                "calendar_id": {"type": "string", "default": "primary"},
                "description": {"type": "string"},
                "location": {"type": "string"},
                "color_id": {"type": "string", "description": "Google color id 1-11"},
                "attendees": {"type": "array", "items": {"type": "string"}, "description": "Attendee email addresses"},
                "recurrence": {"type": "array", "items": {"type": "string"}, "description": "RRULE lines"}
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: CreateEventInput = match parse_input(input) {
            Ok(i) => i,
            Err(out) => return out,
        };
        let (calendar_id, event) = match input.into_event() {
            Ok(parts) => parts,
            Err(e) => return ToolOutput::error(format!("Invalid event: {e}")),
        };

        match ctx.calendar().create_event(&calendar_id, &event).await {
            Ok(created) => ToolOutput::success(format!(
                "Event '{}' created with ID: {} in calendar: {calendar_id}",
                created.summary, created.id
            ))
            .with_structured(&created),
            Err(e) => calendar_error(&e),
        }
    }
}

// ============================================================================
// delete_event_tool
// ============================================================================

#[derive(Debug, Deserialize)]
struct DeleteEventInput {
    event_id: String,
    #[serde(default = "primary")]
    calendar_id: String,
}

pub struct DeleteEventTool;

#[async_trait]
impl Tool for DeleteEventTool {
    fn name(&self) -> &'static str {
        "delete_event_tool"
    }

    fn description(&self) -> String {
        "Delete a calendar event by ID. Attendees are notified of the cancellation.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["event_id"],
            "properties": {
                "event_id": {"type": "string"},
                "calendar_id": {"type": "string", "default": "primary"}
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: DeleteEventInput = match parse_input(input) {
            Ok(i) => i,
            Err(out) => return out,
        };

        match ctx
            .calendar()
            .delete_event(&input.calendar_id, &input.event_id)
            .await
        {
            Ok(()) => ToolOutput::success(format!(
                "Event {} deleted from calendar: {}",
                input.event_id, input.calendar_id
            )),
            Err(e) => calendar_error(&e),
        }
    }
}

// ============================================================================
// edit_event_tool
// ============================================================================

#[derive(Debug, Deserialize)]
struct EditEventInput {
    event_id: String,
    changes: EventChanges,
    #[serde(default = "primary")]
    calendar_id: String,
}

pub struct EditEventTool;

#[async_trait]
impl Tool for EditEventTool {
    fn name(&self) -> &'static str {
        "edit_event_tool"
    }

    fn description(&self) -> String {
        "Change fields of an existing event. Only the fields present in `changes` are modified; changing attendees notifies everyone invited.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["event_id", "changes"],
            "properties": {
                "event_id": {"type": "string"},
                "calendar_id": {"type": "string", "default": "primary"},
                "changes": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": {
                        "summary": {"type": "string"},
                        "description": {"type": "string"},
                        "location": {"type": "string"},
                        "color_id": {"type": "string"},
                        "start": {"type": "string", "description": "RFC 3339"},
                        "end": {"type": "string", "description": "RFC 3339"},
                        "attendees": {"type": "array", "items": {"type": "string"}},
                        "recurrence": {"type": "array", "items": {"type": "string"}}
                    }
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: EditEventInput = match parse_input(input) {
            Ok(i) => i,
            Err(out) => return out,
        };
        if let Err(e) = input.changes.validate() {
            return ToolOutput::error(format!("Invalid changes: {e}"));
        }

        match ctx
            .calendar()
            .update_event(&input.calendar_id, &input.event_id, &input.changes)
            .await
        {
            Ok(updated) => {
                ToolOutput::success(format!("Event updated successfully: '{}'", updated.summary))
                    .with_structured(&updated)
            }
            Err(e) => calendar_error(&e),
        }
    }
}

// ============================================================================
// get_all_events_tool
// ============================================================================

#[derive(Debug, Deserialize)]
struct GetAllEventsInput {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default = "primary")]
    calendar_id: String,
    #[serde(default)]
    time_min: Option<String>,
    #[serde(default)]
    time_max: Option<String>,
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    show_deleted: bool,
}

pub struct GetAllEventsTool;

#[async_trait]
impl Tool for GetAllEventsTool {
    fn name(&self) -> &'static str {
        "get_all_events_tool"
    }

    fn description(&self) -> String {
        "List upcoming events, soonest first. Defaults to the next 10 events from now on the primary calendar; narrow with a time window or a free-text query.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {"type": "integer", "minimum": 1, "maximum": MAX_LIMIT, "default": 10},
                "calendar_id": {"type": "string", "default": "primary"},
                "time_min": {"type": "string", "description": "RFC 3339 lower bound, defaults to now"},
                "time_max": {"type": "string", "description": "RFC 3339 upper bound"},
                "q": {"type": "string", "description": "Free-text search"},
                "show_deleted": {"type": "boolean", "default": false}
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: GetAllEventsInput = match parse_input(input) {
            Ok(i) => i,
            Err(out) => return out,
        };
        let time_min = match parse_bound("time_min", input.time_min.as_deref()) {
            Ok(t) => t.unwrap_or(ctx.now),
            Err(out) => return out,
        };
        let time_max = match parse_bound("time_max", input.time_max.as_deref()) {
            Ok(t) => t,
            Err(out) => return out,
        };

        let query = EventQuery {
            calendar_id: input.calendar_id,
            limit: input.limit.clamp(1, MAX_LIMIT),
            time_min,
            time_max,
            text: input.q.filter(|q| !q.trim().is_empty()),
            show_deleted: input.show_deleted,
        };

        match ctx.calendar().list_events(&query).await {
            Ok(events) => list_output(&events, "No upcoming events."),
            Err(e) => calendar_error(&e),
        }
    }
}

// ============================================================================
// get_calendar_invitations_tool
// ============================================================================

#[derive(Debug, Deserialize)]
struct InvitationsInput {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    time_min: Option<String>,
}

pub struct GetCalendarInvitationsTool;

#[async_trait]
impl Tool for GetCalendarInvitationsTool {
    fn name(&self) -> &'static str {
        "get_calendar_invitations_tool"
    }

    fn description(&self) -> String {
        "List upcoming invitations the user has not answered yet.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {"type": "integer", "minimum": 1, "maximum": MAX_LIMIT, "default": 10},
                "time_min": {"type": "string", "description": "RFC 3339 lower bound, defaults to now"}
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: InvitationsInput = match parse_input(input) {
            Ok(i) => i,
            Err(out) => return out,
        };
        let time_min = match parse_bound("time_min", input.time_min.as_deref()) {
            Ok(t) => t.unwrap_or(ctx.now),
            Err(out) => return out,
        };

        // Invitations are sparse among events, so scan a full page
        let query = EventQuery {
            calendar_id: primary(),
            limit: MAX_LIMIT,
            time_min,
            time_max: None,
            text: None,
            show_deleted: false,
        };

        match ctx.calendar().list_events(&query).await {
            Ok(events) => {
                let limit = usize::try_from(input.limit.clamp(1, MAX_LIMIT)).unwrap_or(usize::MAX);
                let pending: Vec<CalendarEvent> = events
                    .into_iter()
                    .filter(CalendarEvent::awaits_my_response)
                    .take(limit)
                    .collect();
                list_output(&pending, "No pending invitations.")
            }
            Err(e) => calendar_error(&e),
        }
    }
}
