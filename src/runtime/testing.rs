//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use crate::calendar::{
    Attendee, BusyInterval, CalendarEvent, CalendarProvider, Contact, EventChanges, EventQuery,
    NewEvent, ProviderError,
};
use crate::llm::{ContentBlock, LlmError, LlmRequest, LlmResponse, ToolDefinition, Usage};
use crate::state_machine::ConversationState;
use crate::tools::ToolOutput;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Response builders
// ============================================================================

/// Completion carrying only text
pub fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        content: vec![ContentBlock::text(text)],
        end_turn: true,
        usage: Usage::default(),
    }
}

/// Completion requesting the given `(id, tool, input)` calls
pub fn tool_response(calls: Vec<(&str, &str, Value)>) -> LlmResponse {
    LlmResponse {
        content: calls
            .into_iter()
            .map(|(id, name, input)| ContentBlock::tool_use(id, name, input))
            .collect(),
        end_turn: false,
        usage: Usage::default(),
    }
}

// ============================================================================
// Mock LLM Client
// ============================================================================

/// Mock LLM client that returns queued responses
#[allow(dead_code)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    model_id: String,
    delay: Option<Duration>,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
}

#[allow(dead_code)]
impl MockLlmClient {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a successful response
    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue a text completion
    pub fn queue_text(&self, text: &str) {
        self.queue_response(text_response(text));
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Mock Tool Executor
// ============================================================================

/// Mock tool executor with predefined outputs
#[allow(dead_code)]
pub struct MockToolExecutor {
    outputs: HashMap<String, ToolOutput>,
    definitions: Vec<ToolDefinition>,
    delay: Option<Duration>,
    /// Record of tool executions
    pub executions: Mutex<Vec<(String, Value)>>,
}

#[allow(dead_code)]
impl MockToolExecutor {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            definitions: Vec::new(),
            delay: None,
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Add a tool with a predefined output
    pub fn with_tool(mut self, name: impl Into<String>, output: ToolOutput) -> Self {
        let name = name.into();
        self.definitions.push(ToolDefinition {
            name: name.clone(),
            description: format!("Mock {name}"),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        });
        self.outputs.insert(name, output);
        self
    }

    /// Sleep before every execution
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Get recorded executions
    pub fn recorded_executions(&self) -> Vec<(String, Value)> {
        self.executions.lock().unwrap().clone()
    }
}

impl Default for MockToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute(
        &self,
        name: &str,
        input: Value,
        _conv_id: &str,
        _cancel: CancellationToken,
    ) -> Option<ToolOutput> {
        self.executions
            .lock()
            .unwrap()
            .push((name.to_string(), input));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outputs.get(name).cloned()
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory conversation store for testing
#[allow(dead_code)]
#[derive(Default)]
pub struct InMemoryStore {
    states: Mutex<HashMap<String, ConversationState>>,
    fail_saves: AtomicBool,
    saves: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conv_id: &str, state: ConversationState) {
        self.states.lock().unwrap().insert(conv_id.to_string(), state);
    }

    /// Get current state for a conversation
    pub fn get_current_state(&self, conv_id: &str) -> Option<ConversationState> {
        self.states.lock().unwrap().get(conv_id).cloned()
    }

    /// Make every subsequent save fail
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Turn state names in save order
    pub fn saved_turns(&self) -> Vec<String> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load(&self, conv_id: &str) -> Result<ConversationState, StoreError> {
        self.get_current_state(conv_id)
            .ok_or_else(|| StoreError::NotFound(conv_id.to_string()))
    }

    async fn save(&self, conv_id: &str, state: &ConversationState) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }
        self.saves
            .lock()
            .unwrap()
            .push(state.turn.name().to_string());
        self.insert(conv_id, state.clone());
        Ok(())
    }

    async fn exists(&self, conv_id: &str) -> Result<bool, StoreError> {
        Ok(self.states.lock().unwrap().contains_key(conv_id))
    }
}

// ============================================================================
// Scripted calendar provider
// ============================================================================

/// Event fixture with RFC 3339 start and end
pub fn sample_event(id: &str, summary: &str, start: &str, end: &str) -> CalendarEvent {
    CalendarEvent {
        id: id.to_string(),
        summary: summary.to_string(),
        start: start.to_string(),
        end: end.to_string(),
        description: None,
        location: None,
        color_id: None,
        attendees: Vec::new(),
        recurrence: Vec::new(),
        status: Some("confirmed".to_string()),
        html_link: None,
    }
}

/// In-memory calendar that records every call as `operation:args`
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedCalendar {
    events: Mutex<Vec<CalendarEvent>>,
    busy: Vec<BusyInterval>,
    contacts: Vec<Contact>,
    failure: Option<String>,
    calls: Mutex<Vec<String>>,
    last_query: Mutex<Option<EventQuery>>,
}

#[allow(dead_code)]
impl ScriptedCalendar {
    pub fn with_events(events: Vec<CalendarEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    pub fn with_busy(busy: Vec<BusyInterval>) -> Self {
        Self {
            busy,
            ..Self::default()
        }
    }

    pub fn with_contacts(contacts: Vec<Contact>) -> Self {
        Self {
            contacts,
            ..Self::default()
        }
    }

    /// Every call fails with a network error
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_query(&self) -> Option<EventQuery> {
        self.last_query.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.events.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), ProviderError> {
        match &self.failure {
            Some(message) => Err(ProviderError::Network(message.clone())),
            None => Ok(()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn timestamp(at: DateTime<chrono::FixedOffset>) -> String {
    at.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl CalendarProvider for ScriptedCalendar {
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<CalendarEvent>, ProviderError> {
        self.check()?;
        *self.last_query.lock().unwrap() = Some(query.clone());
        let limit = usize::try_from(query.limit).unwrap_or(usize::MAX);
        Ok(self.events().into_iter().take(limit).collect())
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        event: &NewEvent,
    ) -> Result<CalendarEvent, ProviderError> {
        self.check()?;
        self.record(format!("create_event:{calendar_id}"));
        let mut events = self.events.lock().unwrap();
        let created = CalendarEvent {
            description: event.description.clone(),
            location: event.location.clone(),
            color_id: event.color_id.clone(),
            attendees: event
                .attendees
                .iter()
                .map(|email| Attendee {
                    email: email.clone(),
                    display_name: None,
                    response_status: Some("needsAction".to_string()),
                    is_self: false,
                })
                .collect(),
            recurrence: event.recurrence.clone(),
            ..sample_event(
                &format!("evt{}", events.len() + 1),
                &event.summary,
                &timestamp(event.start),
                &timestamp(event.end),
            )
        };
        events.push(created.clone());
        Ok(created)
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        changes: &EventChanges,
    ) -> Result<CalendarEvent, ProviderError> {
        self.check()?;
        self.record(format!("update_event:{calendar_id}:{event_id}"));
        let mut events = self.events.lock().unwrap();
        let event = events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| ProviderError::NotFound(event_id.to_string()))?;
        if let Some(summary) = &changes.summary {
            event.summary.clone_from(summary);
        }
        if let Some(start) = &changes.start {
            event.start.clone_from(start);
        }
        if let Some(end) = &changes.end {
            event.end.clone_from(end);
        }
        if changes.location.is_some() {
            event.location.clone_from(&changes.location);
        }
        if changes.description.is_some() {
            event.description.clone_from(&changes.description);
        }
        Ok(event.clone())
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), ProviderError> {
        self.check()?;
        self.record(format!("delete_event:{calendar_id}:{event_id}"));
        let mut events = self.events.lock().unwrap();
        let before = events.len();
        events.retain(|e| e.id != event_id);
        if events.len() == before {
            return Err(ProviderError::NotFound(event_id.to_string()));
        }
        Ok(())
    }

    async fn free_busy(
        &self,
        calendar_ids: &[String],
        _time_min: DateTime<Utc>,
        _time_max: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, ProviderError> {
        self.check()?;
        self.record(format!("free_busy:{}", calendar_ids.join(",")));
        Ok(self.busy.clone())
    }

    async fn search_contacts(&self, query: &str) -> Result<Vec<Contact>, ProviderError> {
        self.check()?;
        self.record(format!("search_contacts:{query}"));
        Ok(self.contacts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::recovery::INTERRUPTED_TOOL_OUTPUT;
    use crate::runtime::{
        ConversationRuntime, Emitter, RuntimeManager, StreamEvent, Timeouts, TurnError,
    };
    use crate::state_machine::state::{Message, Role, ToolCall, TurnErrorKind};
    use crate::state_machine::{TurnSettings, TurnState};
    use crate::telemetry::Telemetry;
    use crate::tools::{ToolKind, ToolRegistry};
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Arc;

    type TestRuntime = ConversationRuntime<InMemoryStore, MockLlmClient, dyn ToolExecutor>;

    const VALID: &str = r#"{"valid": true}"#;

    fn runtime(
        settings: TurnSettings,
        store: &Arc<InMemoryStore>,
        llm: &Arc<MockLlmClient>,
        tools: Arc<dyn ToolExecutor>,
    ) -> TestRuntime {
        ConversationRuntime::new("conv-1", settings, store.clone(), llm.clone(), tools)
    }

    fn calendar_tools(calendar: ScriptedCalendar) -> Arc<dyn ToolExecutor> {
        Arc::new(ToolRegistryExecutor::new(
            ToolRegistry::standard(),
            Arc::new(calendar),
        ))
    }

    async fn run(
        runtime: &mut TestRuntime,
        text: &str,
        fresh: bool,
    ) -> (Vec<StreamEvent>, Result<(), TurnError>) {
        let (emitter, stream) = Emitter::channel("conv-1");
        let result = runtime.run_turn(text.to_string(), fresh, emitter).await;
        (stream.collect().await, result)
    }

    fn no_validator() -> TurnSettings {
        TurnSettings {
            validator_enabled: false,
            ..TurnSettings::default()
        }
    }

    #[tokio::test]
    async fn test_mock_llm_client() {
        let client = MockLlmClient::new("mock");
        client.queue_text("hello");
        client.queue_error(LlmError::rate_limit("slow down"));

        let request = LlmRequest::new(vec![]);
        assert_eq!(client.complete(&request).await.unwrap().text(), "hello");
        assert!(client.complete(&request).await.is_err());
        assert_eq!(client.recorded_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.load("nope").await,
            Err(StoreError::NotFound(_))
        ));
        store.save("c", &ConversationState::new(3)).await.unwrap();
        assert!(store.exists("c").await.unwrap());

        store.fail_saves(true);
        assert!(matches!(
            store.save("c", &ConversationState::new(3)).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    /// Fresh conversation, one tool round, final answer mentions the events
    #[tokio::test]
    async fn test_calendar_question_with_one_tool_round() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_text(VALID);
        llm.queue_response(tool_response(vec![(
            "call_1",
            "get_all_events_tool",
            json!({"limit": 5}),
        )]));
        llm.queue_text(r#"{"response": "Tomorrow you have Standup at 09:00.", "events": [{"type": "existing", "metadata": {"id": "e1"}}]}"#);

        let calendar = ScriptedCalendar::with_events(vec![sample_event(
            "e1",
            "Standup",
            "2026-10-17T09:00:00Z",
            "2026-10-17T09:15:00Z",
        )]);
        let mut runtime = runtime(TurnSettings::default(), &store, &llm, calendar_tools(calendar));

        let (events, result) = run(&mut runtime, "What's on my calendar tomorrow?", true).await;
        assert!(result.is_ok());
        assert_eq!(
            events[0],
            StreamEvent::Info {
                message: ToolKind::GetAllEvents.progress_label().to_string()
            }
        );
        let StreamEvent::FinalGenerated {
            message,
            events: answer_events,
            persisted,
        } = &events[1]
        else {
            panic!("expected final event, got {:?}", events[1]);
        };
        assert!(message.contains("Standup"));
        assert_eq!(answer_events.len(), 1);
        assert!(*persisted);
        assert_eq!(events.len(), 2);

        let requests = llm.recorded_requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].tools.is_empty());
        assert_eq!(
            requests[0].response_format.as_ref().unwrap().name,
            "validator_decision"
        );
        assert_eq!(requests[1].tools.len(), ToolKind::ALL.len());

        let state = store.get_current_state("conv-1").unwrap();
        assert_eq!(state.turn, TurnState::Done);
        assert_eq!(state.tool_calls_remaining, 4);
        assert_eq!(state.validator_messages.len(), 3);
        let tool_result = state
            .agent_messages
            .iter()
            .find(|m| m.role == Role::ToolResult)
            .unwrap();
        assert!(tool_result.content.to_text().contains("Standup (2026-10-17T09:00:00Z"));
    }

    /// A budget of one leaves the follow-up completion without tools
    #[tokio::test]
    async fn test_exhausted_budget_forces_text_answer() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(tool_response(vec![(
            "call_1",
            "get_all_events_tool",
            json!({}),
        )]));
        let mut wants_more = tool_response(vec![("call_2", "get_all_events_tool", json!({}))]);
        wants_more
            .content
            .insert(0, ContentBlock::text(r#"{"response": "Nothing planned."}"#));
        llm.queue_response(wants_more);

        let tools = Arc::new(
            MockToolExecutor::new()
                .with_tool("get_all_events_tool", ToolOutput::success("No upcoming events.")),
        );
        let settings = TurnSettings {
            tool_budget: 1,
            ..no_validator()
        };
        let mut runtime = runtime(settings, &store, &llm, tools.clone());

        let (events, result) = run(&mut runtime, "anything tomorrow?", true).await;
        assert!(result.is_ok());
        assert!(matches!(
            events.last(),
            Some(StreamEvent::FinalGenerated { message, .. }) if message == "Nothing planned."
        ));
        assert_eq!(tools.recorded_executions().len(), 1);

        let requests = llm.recorded_requests();
        assert!(!requests[0].tools.is_empty());
        assert!(requests[1].tools.is_empty());
        assert_eq!(runtime.state().tool_calls_remaining, 0);
    }

    /// Validator timeout aborts the turn and leaves the validator log alone
    #[tokio::test]
    async fn test_validator_timeout_is_fatal() {
        let store = Arc::new(InMemoryStore::new());
        let mut prior = ConversationState::new(5);
        prior.validator_messages = vec![
            Message::system("validator"),
            Message::user("earlier question"),
            Message::assistant(VALID),
        ];
        prior.turn = TurnState::Done;
        store.insert("conv-1", prior);

        let llm = Arc::new(MockLlmClient::new("mock").with_delay(Duration::from_secs(5)));
        llm.queue_text(VALID);
        let mut runtime = runtime(
            TurnSettings::default(),
            &store,
            &llm,
            Arc::new(MockToolExecutor::new()),
        )
        .with_timeouts(Timeouts {
            llm: Duration::from_millis(20),
            tool: Duration::from_secs(1),
        });

        let (events, result) = run(&mut runtime, "move my dentist appointment", false).await;
        assert!(matches!(
            result,
            Err(TurnError::Failed(TurnErrorKind::ValidationFailed))
        ));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Error { kind, .. } if kind == "validation_failed"
        ));
        assert_eq!(llm.recorded_requests().len(), 1);

        let state = store.get_current_state("conv-1").unwrap();
        assert_eq!(state.validator_messages.len(), 3);
        assert!(state.agent_messages.is_empty());
    }

    /// Two similar contacts suspend the turn; the reply resumes it
    #[tokio::test]
    async fn test_ambiguous_contact_suspends_and_resumes() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_text(VALID);
        llm.queue_response(tool_response(vec![(
            "call_1",
            "find_similar_contacts_tool",
            json!({"name": "John"}),
        )]));

        let calendar = Arc::new(ScriptedCalendar::with_contacts(vec![
            Contact {
                display_name: "John Smith".into(),
                address: "john.smith@example.com".into(),
            },
            Contact {
                display_name: "John Doe".into(),
                address: "jdoe@example.com".into(),
            },
        ]));
        let tools: Arc<dyn ToolExecutor> = Arc::new(ToolRegistryExecutor::new(
            ToolRegistry::standard(),
            calendar.clone(),
        ));
        let mut runtime = runtime(TurnSettings::default(), &store, &llm, tools);

        let (events, result) = run(&mut runtime, "Set up lunch with John on Friday", true).await;
        assert!(result.is_ok());
        let Some(StreamEvent::AskUserData {
            message,
            candidates,
        }) = events.last()
        else {
            panic!("expected ask_user_data, got {events:?}");
        };
        assert_eq!(candidates.len(), 2);
        assert!(message.contains("Which one did you mean?"));

        let suspended = store.get_current_state("conv-1").unwrap();
        assert!(suspended.turn.is_suspended());
        assert_eq!(suspended.pending_contact_matches.len(), 2);

        // Resume: no validation, no second lookup
        llm.queue_text(r#"{"response": "Lunch with John Doe is booked."}"#);
        let (events, result) = run(&mut runtime, "the second one", false).await;
        assert!(result.is_ok(), "{result:?}");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::FinalGenerated { message, .. }) if message == "Lunch with John Doe is booked."
        ));
        assert_eq!(calendar.calls(), ["search_contacts:John"]);

        let requests = llm.recorded_requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].response_format.as_ref().unwrap().name, "agent_answer");

        let state = store.get_current_state("conv-1").unwrap();
        assert!(state.pending_contact_matches.is_empty());
        assert_eq!(state.turn, TurnState::Done);
        let resolved = state
            .agent_messages
            .iter()
            .find(|m| m.role == Role::ToolResult)
            .unwrap();
        assert_eq!(resolved.tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn test_contact_choice_by_index() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(tool_response(vec![(
            "call_1",
            "find_similar_contacts_tool",
            json!({"name": "John"}),
        )]));
        llm.queue_text(r#"{"response": "Invited."}"#);

        let calendar = ScriptedCalendar::with_contacts(vec![
            Contact {
                display_name: "John Smith".into(),
                address: "john.smith@example.com".into(),
            },
            Contact {
                display_name: "John Doe".into(),
                address: "jdoe@example.com".into(),
            },
        ]);
        let mut runtime = runtime(no_validator(), &store, &llm, calendar_tools(calendar));

        run(&mut runtime, "invite John", true).await;
        let (_, result) = run(&mut runtime, "2", false).await;
        assert!(result.is_ok());

        let state = store.get_current_state("conv-1").unwrap();
        let resolved = state
            .agent_messages
            .iter()
            .find(|m| m.role == Role::ToolResult)
            .unwrap();
        assert!(resolved
            .content
            .to_text()
            .contains("User selected: John Doe <jdoe@example.com>"));
    }

    #[tokio::test]
    async fn test_rejected_message_never_reaches_agent() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_text(r#"{"valid": false, "response": "I only handle calendars."}"#);
        let tools = Arc::new(MockToolExecutor::new());
        let mut runtime = runtime(TurnSettings::default(), &store, &llm, tools.clone());

        let (events, result) = run(&mut runtime, "write me a poem", true).await;
        assert!(result.is_ok());
        assert_eq!(
            events,
            [StreamEvent::FinalGenerated {
                message: "I only handle calendars.".into(),
                events: vec![],
                persisted: true,
            }]
        );
        assert_eq!(llm.recorded_requests().len(), 1);
        assert!(tools.recorded_executions().is_empty());

        let state = store.get_current_state("conv-1").unwrap();
        assert!(!state.is_valid_input);
        assert!(state.agent_messages.is_empty());
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_error(LlmError::server_error("502 bad gateway"));
        llm.queue_text(r#"{"response": "Hi there."}"#);
        let settings = TurnSettings {
            retry_base: Duration::from_millis(1),
            ..no_validator()
        };
        let mut runtime = runtime(settings, &store, &llm, Arc::new(MockToolExecutor::new()));

        let (events, result) = run(&mut runtime, "hello calendar", true).await;
        assert!(result.is_ok());
        assert!(matches!(events.last(), Some(StreamEvent::FinalGenerated { .. })));
        assert_eq!(llm.recorded_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_tool_timeout_becomes_error_result() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(tool_response(vec![(
            "call_1",
            "get_all_events_tool",
            json!({}),
        )]));
        llm.queue_text(r#"{"response": "The calendar is slow right now."}"#);
        let tools = Arc::new(
            MockToolExecutor::new()
                .with_tool("get_all_events_tool", ToolOutput::success("late"))
                .with_delay(Duration::from_secs(5)),
        );
        let mut runtime = runtime(no_validator(), &store, &llm, tools).with_timeouts(Timeouts {
            llm: Duration::from_secs(1),
            tool: Duration::from_millis(20),
        });

        let (_, result) = run(&mut runtime, "what's next?", true).await;
        assert!(result.is_ok());

        let state = store.get_current_state("conv-1").unwrap();
        let tool_result = state
            .agent_messages
            .iter()
            .find(|m| m.role == Role::ToolResult)
            .unwrap();
        assert!(tool_result.is_error);
        assert!(tool_result.content.to_text().starts_with("Tool timed out"));
    }

    #[tokio::test]
    async fn test_unknown_tool_aborts_turn() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_response(tool_response(vec![("call_1", "send_email_tool", json!({}))]));
        let tools = Arc::new(MockToolExecutor::new());
        let mut runtime = runtime(no_validator(), &store, &llm, tools.clone());

        let (events, result) = run(&mut runtime, "email Ana", true).await;
        assert!(matches!(
            result,
            Err(TurnError::Failed(TurnErrorKind::UnknownTool))
        ));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { kind, .. }) if kind == "unknown_tool"
        ));
        assert!(tools.recorded_executions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_save_flags_answer() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_saves(true);
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_text(r#"{"response": "Done."}"#);
        let mut runtime = runtime(no_validator(), &store, &llm, Arc::new(MockToolExecutor::new()));

        let (events, _) = run(&mut runtime, "hello there", true).await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::FinalGenerated { persisted: false, .. })
        ));
        assert!(store.get_current_state("conv-1").is_none());
    }

    #[tokio::test]
    async fn test_missing_conversation_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        let mut runtime = runtime(no_validator(), &store, &llm, Arc::new(MockToolExecutor::new()));

        let (events, result) = run(&mut runtime, "hello again", false).await;
        assert!(matches!(result, Err(TurnError::Store(StoreError::NotFound(_)))));
        assert!(matches!(
            &events[0],
            StreamEvent::Error { kind, .. } if kind == "not_found"
        ));
        assert!(llm.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_tool_loop_is_repaired_before_next_turn() {
        let store = Arc::new(InMemoryStore::new());
        let call = ToolCall::new("call_9", "delete_event_tool", json!({"event_id": "e1"}));
        let mut stuck = ConversationState::new(5);
        stuck.agent_messages = vec![
            Message::system("agent"),
            Message::user("delete standup"),
            Message::assistant_with_tools("", vec![call.clone()]),
        ];
        stuck.turn = TurnState::ToolLoop {
            current: call,
            remaining: vec![],
        };
        store.insert("conv-1", stuck);

        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_text(r#"{"response": "Hello!"}"#);
        let tools = Arc::new(MockToolExecutor::new());
        let mut runtime = runtime(no_validator(), &store, &llm, tools.clone());

        let (_, result) = run(&mut runtime, "hi again", false).await;
        assert!(result.is_ok());
        assert!(tools.recorded_executions().is_empty());

        let state = store.get_current_state("conv-1").unwrap();
        let repaired = &state.agent_messages[3];
        assert_eq!(repaired.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(repaired.content.to_text(), INTERRUPTED_TOOL_OUTPUT);
        assert_eq!(store.saved_turns().first().map(String::as_str), Some("failed"));
    }

    fn manager(llm: &Arc<MockLlmClient>, store: &Arc<InMemoryStore>) -> RuntimeManager {
        RuntimeManager::new(
            store.clone(),
            llm.clone(),
            Arc::new(MockToolExecutor::new()),
            no_validator(),
            Arc::new(Telemetry::default()),
        )
    }

    #[tokio::test]
    async fn test_manager_start_opens_with_trace_id() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_text(r#"{"response": "Hi!"}"#);
        let manager = manager(&llm, &store);

        let (id, stream) = manager.start("hello calendar".into()).await;
        let events: Vec<StreamEvent> = stream.collect().await;
        assert_eq!(
            events.first(),
            Some(&StreamEvent::TraceId {
                trace_id: id.clone()
            })
        );
        assert!(events.last().unwrap().is_terminal());
        assert!(store.get_current_state(&id).is_some());
        assert_eq!(manager.active_conversations().await, 1);
    }

    #[tokio::test]
    async fn test_manager_rejects_unknown_conversation() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock"));
        let manager = manager(&llm, &store);

        let err = manager
            .continue_conversation("missing", "hello".into())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("missing".into()));
    }

    #[tokio::test]
    async fn test_manager_serializes_turns_of_one_conversation() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new("mock").with_delay(Duration::from_millis(20)));
        llm.queue_text(r#"{"response": "first"}"#);
        llm.queue_text(r#"{"response": "second"}"#);
        let manager = manager(&llm, &store);

        let (id, first) = manager.start("first question".into()).await;
        // Queued behind the first turn, before it has been persisted
        let second = manager
            .continue_conversation(&id, "second question".into())
            .await
            .unwrap();

        let first: Vec<StreamEvent> = first.collect().await;
        let second: Vec<StreamEvent> = second.collect().await;
        assert!(matches!(
            first.last(),
            Some(StreamEvent::FinalGenerated { message, .. }) if message == "first"
        ));
        assert!(matches!(
            second.last(),
            Some(StreamEvent::FinalGenerated { message, .. }) if message == "second"
        ));

        let state = store.get_current_state(&id).unwrap();
        let users: Vec<_> = state
            .agent_messages
            .iter()
            .filter(|m| m.role == Role::User)
            .collect();
        assert_eq!(users.len(), 2);
    }
}
