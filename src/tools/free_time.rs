//! Free time finder over the free/busy view of one or more calendars

use super::{parse_input, Tool, ToolContext, ToolOutput};
use crate::calendar::{parse_timestamp, BusyInterval};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Write;

/// A gap in the schedule at least as long as the requested duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FreeSlot {
    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

/// Gaps between busy blocks inside `[window_start, window_end)` that fit
/// `duration`. Busy blocks may overlap and arrive in any order.
pub fn free_slots(
    busy: &[BusyInterval],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    duration: Duration,
) -> Vec<FreeSlot> {
    let mut blocks: Vec<BusyInterval> = busy
        .iter()
        .filter(|b| b.end > window_start && b.start < window_end)
        .copied()
        .collect();
    blocks.sort_by_key(|b| b.start);

    let mut slots = Vec::new();
    let mut cursor = window_start;
    for block in blocks {
        if block.start > cursor && block.start - cursor >= duration {
            slots.push(FreeSlot {
                start: cursor,
                end: block.start,
            });
        }
        cursor = cursor.max(block.end);
    }
    if window_end > cursor && window_end - cursor >= duration {
        slots.push(FreeSlot {
            start: cursor,
            end: window_end,
        });
    }
    slots
}

fn default_calendars() -> Vec<String> {
    vec!["primary".to_string()]
}

#[derive(Debug, Deserialize)]
struct FindFreeTimeInput {
    time_min: String,
    time_max: String,
    duration_minutes: u32,
    #[serde(default = "default_calendars")]
    calendar_ids: Vec<String>,
}

pub struct FindFreeTimeTool;

#[async_trait]
impl Tool for FindFreeTimeTool {
    fn name(&self) -> &'static str {
        "find_free_time_tool"
    }

    fn description(&self) -> String {
        "Find free slots of at least `duration_minutes` between two RFC 3339 times, across one or more calendars.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["time_min", "time_max", "duration_minutes"],
            "properties": {
                "time_min": {"type": "string", "description": "Window start, RFC 3339"},
                "time_max": {"type": "string", "description": "Window end, RFC 3339"},
                "duration_minutes": {"type": "integer", "minimum": 1},
                "calendar_ids": {"type": "array", "items": {"type": "string"}, "default": ["primary"]}
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: FindFreeTimeInput = match parse_input(input) {
            Ok(i) => i,
            Err(out) => return out,
        };
        let window = parse_timestamp("time_min", &input.time_min)
            .and_then(|min| Ok((min, parse_timestamp("time_max", &input.time_max)?)));
        let (min, max) = match window {
            Ok((min, max)) => (min.with_timezone(&Utc), max.with_timezone(&Utc)),
            Err(e) => return ToolOutput::error(e),
        };
        if min >= max {
            return ToolOutput::error("time_min must be before time_max");
        }
        if input.duration_minutes == 0 {
            return ToolOutput::error("duration_minutes must be at least 1");
        }
        let calendars = if input.calendar_ids.is_empty() {
            default_calendars()
        } else {
            input.calendar_ids
        };

        let busy = match ctx.calendar().free_busy(&calendars, min, max).await {
            Ok(busy) => busy,
            Err(e) => return ToolOutput::error(format!("Calendar error: {e}")),
        };
        let slots = free_slots(&busy, min, max, Duration::minutes(i64::from(input.duration_minutes)));

        if slots.is_empty() {
            return ToolOutput::success(format!(
                "No free slot of {} minutes between {} and {}.",
                input.duration_minutes, input.time_min, input.time_max
            ))
            .with_structured(&slots);
        }

        let mut text = String::from("Free slots:");
        for slot in &slots {
            let _ = write!(
                text,
                "\n- {} - {} ({} min)",
                slot.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                slot.end.to_rfc3339_opts(SecondsFormat::Secs, true),
                slot.minutes()
            );
        }
        ToolOutput::success(text).with_structured(&slots)
    }
}
