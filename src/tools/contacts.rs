//! Contact lookup by approximate name

use super::{parse_input, Tool, ToolContext, ToolOutput};
use crate::calendar::Contact;
use crate::state_machine::state::ContactMatch;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Write;
use strsim::jaro_winkler;

/// Candidates scoring below this are not reported
pub const MATCH_THRESHOLD: f64 = 0.7;

/// Score contacts against `name` and keep the best `limit` above the threshold.
///
/// The score is the better of the full display name and the first name, so
/// "John" matches "John Smith" as well as "Jon" does.
pub fn score_contacts(name: &str, contacts: Vec<Contact>, limit: usize) -> Vec<ContactMatch> {
    let query = name.trim().to_lowercase();
    if query.is_empty() {
        return Vec::new();
    }

    let mut matches: Vec<ContactMatch> = contacts
        .into_iter()
        .filter_map(|contact| {
            let full = contact.display_name.to_lowercase();
            let first = full.split_whitespace().next().unwrap_or_default();
            let score = jaro_winkler(&query, &full)
                .max(jaro_winkler(&query, first))
                .clamp(0.0, 1.0);
            (score >= MATCH_THRESHOLD).then(|| ContactMatch {
                display_name: contact.display_name,
                address: contact.address,
                score,
            })
        })
        .collect();

    matches.sort_by(|a, b| b.score.total_cmp(&a.score));
    matches.dedup_by(|a, b| a.address.eq_ignore_ascii_case(&b.address));
    matches.truncate(limit);
    matches
}

fn default_limit() -> usize {
    5
}

#[derive(Debug, Deserialize)]
struct FindContactsInput {
    name: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

pub struct FindSimilarContactsTool;

#[async_trait]
impl Tool for FindSimilarContactsTool {
    fn name(&self) -> &'static str {
        "find_similar_contacts_tool"
    }

    fn description(&self) -> String {
        "Look up people in the user's contacts by (possibly partial or misspelled) name and return their email addresses, best match first. Use before inviting someone named only by name.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {"type": "string", "description": "Name as the user wrote it"},
                "limit": {"type": "integer", "minimum": 1, "maximum": 20, "default": 5}
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: FindContactsInput = match parse_input(input) {
            Ok(i) => i,
            Err(out) => return out,
        };
        if input.name.trim().is_empty() {
            return ToolOutput::error("name must not be empty");
        }

        let contacts = match ctx.calendar().search_contacts(input.name.trim()).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::error(format!("Calendar error: {e}")),
        };
        let matches = score_contacts(&input.name, contacts, input.limit.clamp(1, 20));

        if matches.is_empty() {
            return ToolOutput::success(format!("No contacts found matching '{}'.", input.name))
                .with_structured(&matches);
        }

        let mut text = format!("Found {} contact(s) matching '{}':", matches.len(), input.name);
        for m in &matches {
            let _ = write!(text, "\n- {} <{}> (score {:.2})", m.display_name, m.address, m.score);
        }
        ToolOutput::success(text).with_structured(&matches)
    }
}
