//! Google Calendar and People REST provider

use super::{
    Attendee, BusyInterval, CalendarEvent, CalendarProvider, Contact, EventChanges, EventQuery,
    NewEvent, ProviderError,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
pub const DEFAULT_PEOPLE_BASE: &str = "https://people.googleapis.com/v1";

/// Google Calendar provider authenticated with a bearer token
pub struct GoogleCalendar {
    client: Client,
    token: Option<String>,
    api_base: String,
    people_base: String,
}

impl GoogleCalendar {
    pub fn new(
        token: Option<String>,
        api_base: Option<String>,
        people_base: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            token,
            api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            people_base: people_base.unwrap_or_else(|| DEFAULT_PEOPLE_BASE.to_string()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    fn url(base: &str, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = Url::parse(base)
            .map_err(|e| ProviderError::Decode(format!("invalid base url '{base}': {e}")))?;
        url.path_segments_mut()
            .map_err(|()| ProviderError::Decode(format!("base url '{base}' cannot have a path")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> Result<RequestBuilder, ProviderError> {
        let token = self.token.as_deref().ok_or(ProviderError::NotConfigured)?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn send(builder: RequestBuilder) -> Result<Response, ProviderError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Network(format!("Request timeout: {e}"))
            } else {
                ProviderError::Network(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<GoogleErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        Err(match status.as_u16() {
            401 | 403 => ProviderError::Unauthorized(message),
            404 | 410 => ProviderError::NotFound(message),
            code => ProviderError::Rejected {
                status: code,
                message,
            },
        })
    }

    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ProviderError> {
        let response = Self::send(builder).await?;
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(format!("Failed to read response: {e}")))?;
        serde_json::from_str(&body).map_err(|e| ProviderError::Decode(format!("{e}: {body}")))
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendar {
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<CalendarEvent>, ProviderError> {
        let url = Self::url(&self.api_base, &["calendars", &query.calendar_id, "events"])?;
        let mut params = vec![
            ("maxResults", query.limit.to_string()),
            ("timeMin", rfc3339(query.time_min)),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
            ("showDeleted", query.show_deleted.to_string()),
        ];
        if let Some(max) = query.time_max {
            params.push(("timeMax", rfc3339(max)));
        }
        if let Some(text) = &query.text {
            params.push(("q", text.clone()));
        }

        let list: GoogleEventList =
            Self::send_json(self.request(Method::GET, url)?.query(&params)).await?;
        Ok(list.items.into_iter().map(CalendarEvent::from).collect())
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        event: &NewEvent,
    ) -> Result<CalendarEvent, ProviderError> {
        let url = Self::url(&self.api_base, &["calendars", calendar_id, "events"])?;
        let builder = self
            .request(Method::POST, url)?
            .query(&[("sendUpdates", "all")])
            .json(&new_event_body(event));
        let created: GoogleEvent = Self::send_json(builder).await?;
        Ok(created.into())
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        changes: &EventChanges,
    ) -> Result<CalendarEvent, ProviderError> {
        let url = Self::url(&self.api_base, &["calendars", calendar_id, "events", event_id])?;
        let send_updates = if changes.notifies_attendees() { "all" } else { "none" };
        let builder = self
            .request(Method::PATCH, url)?
            .query(&[("sendUpdates", send_updates)])
            .json(&patch_body(changes));
        let updated: GoogleEvent = Self::send_json(builder).await?;
        Ok(updated.into())
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), ProviderError> {
        let url = Self::url(&self.api_base, &["calendars", calendar_id, "events", event_id])?;
        Self::send(
            self.request(Method::DELETE, url)?
                .query(&[("sendUpdates", "all")]),
        )
        .await?;
        Ok(())
    }

    async fn free_busy(
        &self,
        calendar_ids: &[String],
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, ProviderError> {
        let url = Self::url(&self.api_base, &["freeBusy"])?;
        let body = json!({
            "timeMin": rfc3339(time_min),
            "timeMax": rfc3339(time_max),
            "items": calendar_ids.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
        });
        let response: FreeBusyResponse =
            Self::send_json(self.request(Method::POST, url)?.json(&body)).await?;
        Ok(busy_intervals(response))
    }

    async fn search_contacts(&self, query: &str) -> Result<Vec<Contact>, ProviderError> {
        let url = Self::url(&self.people_base, &["people:searchContacts"])?;
        let builder = self.request(Method::GET, url)?.query(&[
            ("query", query),
            ("readMask", "names,emailAddresses"),
            ("pageSize", "30"),
        ]);
        let response: ContactSearchResponse = Self::send_json(builder).await?;
        Ok(contacts_from(response))
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn new_event_body(event: &NewEvent) -> Value {
    let mut body = json!({
        "summary": event.summary,
        "start": {"dateTime": event.start.to_rfc3339()},
        "end": {"dateTime": event.end.to_rfc3339()},
    });
    if let Some(obj) = body.as_object_mut() {
        optional_fields(
            obj,
            event.description.as_ref(),
            event.location.as_ref(),
            event.color_id.as_ref(),
        );
        if !event.attendees.is_empty() {
            obj.insert("attendees".into(), attendee_list(&event.attendees));
        }
        if !event.recurrence.is_empty() {
            obj.insert("recurrence".into(), json!(event.recurrence));
        }
    }
    body
}

fn patch_body(changes: &EventChanges) -> Value {
    let mut obj = Map::new();
    if let Some(summary) = &changes.summary {
        obj.insert("summary".into(), json!(summary));
    }
    optional_fields(
        &mut obj,
        changes.description.as_ref(),
        changes.location.as_ref(),
        changes.color_id.as_ref(),
    );
    if let Some(start) = &changes.start {
        obj.insert("start".into(), json!({"dateTime": start}));
    }
    if let Some(end) = &changes.end {
        obj.insert("end".into(), json!({"dateTime": end}));
    }
    if let Some(attendees) = &changes.attendees {
        obj.insert("attendees".into(), attendee_list(attendees));
    }
    if let Some(recurrence) = &changes.recurrence {
        obj.insert("recurrence".into(), json!(recurrence));
    }
    Value::Object(obj)
}

fn optional_fields(
    obj: &mut Map<String, Value>,
    description: Option<&String>,
    location: Option<&String>,
    color_id: Option<&String>,
) {
    for (key, value) in [
        ("description", description),
        ("location", location),
        ("colorId", color_id),
    ] {
        if let Some(value) = value {
            obj.insert(key.into(), json!(value));
        }
    }
}

fn attendee_list(addresses: &[String]) -> Value {
    Value::Array(addresses.iter().map(|a| json!({"email": a})).collect())
}

fn busy_intervals(response: FreeBusyResponse) -> Vec<BusyInterval> {
    let mut busy: Vec<BusyInterval> = response
        .calendars
        .into_values()
        .flat_map(|c| c.busy)
        .collect();
    busy.sort_by_key(|b| b.start);
    busy
}

fn contacts_from(response: ContactSearchResponse) -> Vec<Contact> {
    response
        .results
        .into_iter()
        .filter_map(|r| {
            let person = r.person;
            let address = person.email_addresses.into_iter().next()?.value;
            let display_name = person
                .names
                .into_iter()
                .next()
                .map_or_else(|| address.clone(), |n| n.display_name);
            Some(Contact {
                display_name,
                address,
            })
        })
        .collect()
}

// Google API types

#[derive(Debug, Deserialize)]
struct GoogleErrorResponse {
    error: GoogleErrorBody,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GoogleEventList {
    #[serde(default)]
    items: Vec<GoogleEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEvent {
    id: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    color_id: Option<String>,
    #[serde(default)]
    start: GoogleTime,
    #[serde(default)]
    end: GoogleTime,
    #[serde(default)]
    attendees: Vec<GoogleAttendee>,
    #[serde(default)]
    recurrence: Vec<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    html_link: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleTime {
    #[serde(default)]
    date_time: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

impl GoogleTime {
    fn into_string(self) -> String {
        self.date_time.or(self.date).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleAttendee {
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    response_status: Option<String>,
    #[serde(default, rename = "self")]
    is_self: bool,
}

impl From<GoogleEvent> for CalendarEvent {
    fn from(event: GoogleEvent) -> Self {
        CalendarEvent {
            id: event.id,
            summary: event.summary.unwrap_or_else(|| "(no title)".to_string()),
            start: event.start.into_string(),
            end: event.end.into_string(),
            description: event.description,
            location: event.location,
            color_id: event.color_id,
            attendees: event
                .attendees
                .into_iter()
                .map(|a| Attendee {
                    email: a.email,
                    display_name: a.display_name,
                    response_status: a.response_status,
                    is_self: a.is_self,
                })
                .collect(),
            recurrence: event.recurrence,
            status: event.status,
            html_link: event.html_link,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FreeBusyResponse {
    #[serde(default)]
    calendars: std::collections::HashMap<String, FreeBusyCalendar>,
}

#[derive(Debug, Deserialize)]
struct FreeBusyCalendar {
    #[serde(default)]
    busy: Vec<BusyInterval>,
}

#[derive(Debug, Deserialize)]
struct ContactSearchResponse {
    #[serde(default)]
    results: Vec<ContactSearchResult>,
}

#[derive(Debug, Deserialize)]
struct ContactSearchResult {
    person: Person,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Person {
    #[serde(default)]
    names: Vec<PersonName>,
    #[serde(default)]
    email_addresses: Vec<PersonEmail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonName {
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct PersonEmail {
    value: String,
}
