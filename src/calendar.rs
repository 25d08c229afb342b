//! Calendar and contacts provider port
//!
//! Tools talk to the user's calendar through `CalendarProvider`; the Google
//! REST implementation lives in `google`.

pub mod google;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors from the calendar provider
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("calendar provider is not configured")]
    NotConfigured,
    #[error("authorization rejected: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected provider response: {0}")]
    Decode(String),
}

/// An event attendee as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attendee {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// `needsAction`, `accepted`, `declined` or `tentative`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<String>,
    /// The attendee is the calendar owner
    #[serde(default)]
    pub is_self: bool,
}

/// A calendar event. Start and end are RFC 3339 timestamps, or plain dates
/// for all-day events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: String,
    pub start: String,
    pub end: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<Attendee>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
}

impl CalendarEvent {
    /// The owner's attendance entry still awaits an answer
    pub fn awaits_my_response(&self) -> bool {
        self.attendees
            .iter()
            .any(|a| a.is_self && a.response_status.as_deref() == Some("needsAction"))
    }

    /// One-line summary used in tool output
    pub fn line(&self) -> String {
        format!(
            "{} ({} - {}) - ID: {}",
            self.summary, self.start, self.end, self.id
        )
    }
}

/// Event to create
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub summary: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub color_id: Option<String>,
    pub attendees: Vec<String>,
    pub recurrence: Vec<String>,
}

/// Partial update of an event. Every field is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendees: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Vec<String>>,
}

impl EventChanges {
    /// Check the change set before it is sent to the provider
    pub fn validate(&self) -> Result<(), String> {
        if *self == Self::default() {
            return Err("changes must set at least one field".to_string());
        }

        let start = self.start.as_deref().map(|s| parse_timestamp("start", s)).transpose()?;
        let end = self.end.as_deref().map(|s| parse_timestamp("end", s)).transpose()?;
        if let (Some(start), Some(end)) = (start, end) {
            if start >= end {
                return Err("start must be before end".to_string());
            }
        }

        if let Some(bad) = self
            .attendees
            .iter()
            .flatten()
            .find(|address| !address.contains('@'))
        {
            return Err(format!("invalid attendee address '{bad}'"));
        }
        Ok(())
    }

    /// Attendee changes must notify everyone on the invitation
    pub fn notifies_attendees(&self) -> bool {
        self.attendees.is_some()
    }
}

/// Parse an RFC 3339 timestamp, naming the field in the error
pub fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<FixedOffset>, String> {
    DateTime::parse_from_rfc3339(value)
        .map_err(|e| format!("{field} must be an RFC 3339 timestamp ('{value}': {e})"))
}

/// Filters for listing events
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    pub calendar_id: String,
    pub limit: u32,
    pub time_min: DateTime<Utc>,
    pub time_max: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub show_deleted: bool,
}

/// A busy block reported by the free/busy endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// An address-book entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub display_name: String,
    pub address: String,
}

/// Access to the user's calendars and contacts
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<CalendarEvent>, ProviderError>;

    async fn create_event(
        &self,
        calendar_id: &str,
        event: &NewEvent,
    ) -> Result<CalendarEvent, ProviderError>;

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        changes: &EventChanges,
    ) -> Result<CalendarEvent, ProviderError>;

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), ProviderError>;

    async fn free_busy(
        &self,
        calendar_ids: &[String],
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, ProviderError>;

    async fn search_contacts(&self, query: &str) -> Result<Vec<Contact>, ProviderError>;
}

#[async_trait]
impl<T: CalendarProvider + ?Sized> CalendarProvider for Arc<T> {
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<CalendarEvent>, ProviderError> {
        (**self).list_events(query).await
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        event: &NewEvent,
    ) -> Result<CalendarEvent, ProviderError> {
        (**self).create_event(calendar_id, event).await
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        changes: &EventChanges,
    ) -> Result<CalendarEvent, ProviderError> {
        (**self).update_event(calendar_id, event_id, changes).await
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), ProviderError> {
        (**self).delete_event(calendar_id, event_id).await
    }

    async fn free_busy(
        &self,
        calendar_ids: &[String],
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, ProviderError> {
        (**self).free_busy(calendar_ids, time_min, time_max).await
    }

    async fn search_contacts(&self, query: &str) -> Result<Vec<Contact>, ProviderError> {
        (**self).search_contacts(query).await
    }
}
