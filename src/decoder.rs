//! Structured-output decoding
//!
//! Turns raw model text into typed decisions. Models wrap JSON in code fences
//! or surround it with prose often enough that we locate the first balanced
//! object before deserializing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Explanation used when the validator rejects without giving one
pub const DEFAULT_REJECTION: &str =
    "I can only help with calendar-related requests like creating, editing, deleting or listing events.";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no JSON object found in model output")]
    NoJson,
    #[error("model output does not match {target}: {source}")]
    Schema {
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Verdict of the validation step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorDecision {
    pub valid: bool,
    /// Required when `valid` is false; some prompts call this field `reasoning`
    #[serde(default, alias = "reasoning", skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl ValidatorDecision {
    /// Text shown to the user when the request is rejected
    pub fn explanation(&self) -> String {
        self.response
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REJECTION)
            .to_string()
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "valid": {"type": "boolean"},
                "response": {"type": "string"}
            },
            "required": ["valid"]
        })
    }
}

/// What happened to a calendar entry during the turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    New,
    Deleted,
    Edited,
    Existing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: AgentEventKind,
    #[serde(default)]
    pub metadata: Value,
}

/// Final answer of the agent step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAnswer {
    pub response: String,
    #[serde(default)]
    pub events: Vec<AgentEvent>,
}

impl AgentAnswer {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            events: Vec::new(),
        }
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "response": {"type": "string"},
                "events": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "type": {"type": "string", "enum": ["new", "deleted", "edited", "existing"]},
                            "metadata": {"type": "object"}
                        },
                        "required": ["type"]
                    }
                }
            },
            "required": ["response"]
        })
    }
}

/// Decode `raw` into `T`, tolerating code fences and surrounding prose.
pub fn decode<T: DeserializeOwned>(raw: &str, target: &'static str) -> Result<T, DecodeError> {
    let candidate = extract_json_object(raw).ok_or(DecodeError::NoJson)?;
    serde_json::from_str(candidate).map_err(|source| DecodeError::Schema { target, source })
}

pub fn decode_validator(raw: &str) -> Result<ValidatorDecision, DecodeError> {
    decode(raw, "validator decision")
}

/// Agent answers never fail: undecodable text becomes the response verbatim.
pub fn decode_agent_answer(raw: &str) -> AgentAnswer {
    match decode::<AgentAnswer>(raw, "agent answer") {
        Ok(answer) => answer,
        Err(e) => {
            tracing::debug!(error = %e, "Agent output is not structured, using raw text");
            AgentAnswer::text(raw.trim())
        }
    }
}

/// Locate the first balanced `{...}` in `raw`, skipping braces inside strings.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw.get(start..)?.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return raw.get(start..=start + offset);
                }
            }
            _ => {}
        }
    }
    None
}
