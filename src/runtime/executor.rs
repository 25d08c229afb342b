//! Conversation runtime executor
//!
//! Drives one turn: feeds events to the pure transition function and runs the
//! effects it returns. Effects run inline, one at a time, so messages and
//! stream events keep the order the state machine produced them in.

use super::emitter::{Emitter, StreamEvent};
use super::recovery::repair_interrupted;
use super::traits::{ConversationStore, LlmClient, StoreError, ToolExecutor};
use crate::decoder::{AgentAnswer, ValidatorDecision};
use crate::llm::{ContentBlock, LlmError, LlmMessage, LlmRequest, MessageRole, ResponseFormat};
use crate::state_machine::state::{Message, Role, ToolCall, ToolResult, TurnErrorKind};
use crate::state_machine::{
    transition, ConversationState, Effect, Event, TransitionError, TurnContext, TurnOutcome,
    TurnSettings, TurnState,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const MAX_TOKENS: u32 = 4096;

/// Per-call deadlines
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub llm: Duration,
    pub tool: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            llm: Duration::from_secs(60),
            tool: Duration::from_secs(30),
        }
    }
}

/// Why a turn ended with an error event
#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("turn failed: {}", .0.as_str())]
    Failed(TurnErrorKind),
    #[error("turn ended without a terminal event")]
    NoOutcome,
}

impl TurnError {
    /// Terminal stream event reported for this error
    pub fn stream_event(&self) -> StreamEvent {
        match self {
            TurnError::Store(StoreError::NotFound(_)) => StreamEvent::error("not_found", self.to_string()),
            TurnError::Store(StoreError::Unavailable(_)) => {
                let kind = TurnErrorKind::StoreUnavailable;
                StreamEvent::error(kind.as_str(), kind.user_message())
            }
            TurnError::Transition(TransitionError::Busy) => {
                StreamEvent::error("busy", TransitionError::Busy.to_string())
            }
            TurnError::Failed(kind) => StreamEvent::error(kind.as_str(), kind.user_message()),
            TurnError::Transition(TransitionError::InvalidTransition(_)) | TurnError::NoOutcome => {
                let kind = TurnErrorKind::Internal;
                StreamEvent::error(kind.as_str(), kind.user_message())
            }
        }
    }
}

/// Generic conversation runtime that can work with any storage, LLM, and tool implementations
pub struct ConversationRuntime<S, L, T>
where
    S: ConversationStore + ?Sized,
    L: LlmClient + ?Sized,
    T: ToolExecutor + ?Sized,
{
    conversation_id: String,
    settings: TurnSettings,
    store: Arc<S>,
    llm_client: Arc<L>,
    tool_executor: Arc<T>,
    timeouts: Timeouts,
    state: ConversationState,
    /// Whether every save of the current turn succeeded
    persisted: bool,
}

impl<S, L, T> ConversationRuntime<S, L, T>
where
    S: ConversationStore + ?Sized,
    L: LlmClient + ?Sized,
    T: ToolExecutor + ?Sized,
{
    pub fn new(
        conversation_id: impl Into<String>,
        settings: TurnSettings,
        store: Arc<S>,
        llm_client: Arc<L>,
        tool_executor: Arc<T>,
    ) -> Self {
        let state = ConversationState::new(settings.tool_budget);
        Self {
            conversation_id: conversation_id.into(),
            settings,
            store,
            llm_client,
            tool_executor,
            timeouts: Timeouts::default(),
            state,
            persisted: true,
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// State after the last processed event
    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Run one turn for `text`. `fresh` starts a new conversation instead of
    /// loading it. Exactly one terminal event is written to `emitter`.
    pub async fn run_turn(
        &mut self,
        text: String,
        fresh: bool,
        emitter: Emitter,
    ) -> Result<(), TurnError> {
        let mut emitter = Some(emitter);
        let result = match self.process_turn(text, fresh, &mut emitter).await {
            Ok(()) if emitter.is_some() => Err(TurnError::NoOutcome),
            other => other,
        };

        if let Err(e) = &result {
            tracing::warn!(conv_id = %self.conversation_id, error = %e, "Turn ended with error");
            if let Some(emitter) = emitter.take() {
                emitter.finish(e.stream_event());
            }
        }
        result
    }

    async fn process_turn(
        &mut self,
        text: String,
        fresh: bool,
        emitter: &mut Option<Emitter>,
    ) -> Result<(), TurnError> {
        self.persisted = true;
        let loaded = if fresh {
            ConversationState::new(self.settings.tool_budget)
        } else {
            self.store.load(&self.conversation_id).await?
        };

        let decision = repair_interrupted(loaded);
        self.state = decision.state;
        if decision.repaired {
            tracing::warn!(
                conv_id = %self.conversation_id,
                reason = decision.reason.as_str(),
                "Repaired interrupted turn"
            );
            self.persist().await;
        }

        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        let context = TurnContext::new(&self.conversation_id, self.settings.clone(), today);

        // Effects may produce follow-up events; process until none remain
        let mut events_to_process = vec![Event::UserMessage { text }];
        let mut failure = None;

        while let Some(current_event) = events_to_process.pop() {
            let result = transition(&self.state, &context, current_event)?;

            if result.new_state.turn.name() != self.state.turn.name() {
                tracing::debug!(
                    conv_id = %self.conversation_id,
                    from = self.state.turn.name(),
                    to = result.new_state.turn.name(),
                    "Turn state change"
                );
            }
            self.state = result.new_state;

            for effect in result.effects {
                if let Some(generated_event) =
                    self.execute_effect(effect, emitter, &mut failure).await
                {
                    events_to_process.push(generated_event);
                }
            }
        }

        match failure {
            Some(kind) => Err(TurnError::Failed(kind)),
            None => Ok(()),
        }
    }

    /// Execute an effect and optionally return a generated event
    #[allow(clippy::too_many_lines)]
    async fn execute_effect(
        &mut self,
        effect: Effect,
        emitter: &mut Option<Emitter>,
        failure: &mut Option<TurnErrorKind>,
    ) -> Option<Event> {
        match effect {
            Effect::PersistState => {
                self.persist().await;
                None
            }

            Effect::RequestValidation { messages } => {
                let request = LlmRequest::new(to_llm_messages(&messages))
                    .with_response_format(ResponseFormat::new(
                        "validator_decision",
                        ValidatorDecision::schema(),
                    ))
                    .with_max_tokens(MAX_TOKENS);
                tracing::info!(conv_id = %self.conversation_id, "Requesting validation");

                Some(match self.complete(&request).await {
                    Ok(response) => Event::ValidatorResponse {
                        text: response.text(),
                    },
                    Err(e) => self.llm_error_event(e),
                })
            }

            Effect::RequestAgent {
                messages,
                bind_tools,
            } => {
                let mut request = LlmRequest::new(to_llm_messages(&messages))
                    .with_response_format(ResponseFormat::new("agent_answer", AgentAnswer::schema()))
                    .with_max_tokens(MAX_TOKENS);
                if bind_tools {
                    request = request.with_tools(self.tool_executor.definitions());
                }
                tracing::info!(
                    conv_id = %self.conversation_id,
                    bind_tools,
                    tool_calls_remaining = self.state.tool_calls_remaining,
                    "Requesting agent completion"
                );

                Some(match self.complete(&request).await {
                    Ok(response) => {
                        let tool_calls = response
                            .tool_uses()
                            .into_iter()
                            .map(|(id, name, input)| ToolCall::new(id, name, input.clone()))
                            .collect();
                        Event::AgentResponse {
                            text: response.text(),
                            tool_calls,
                        }
                    }
                    Err(e) => self.llm_error_event(e),
                })
            }

            Effect::ExecuteTool { call } => Some(self.execute_tool(call).await),

            Effect::EmitProgress { message } => {
                if let Some(emitter) = emitter.as_ref() {
                    emitter.info(message);
                }
                None
            }

            Effect::Finish(outcome) => {
                let event = match outcome {
                    TurnOutcome::Answered { message, events } => StreamEvent::FinalGenerated {
                        message,
                        events,
                        persisted: self.persisted,
                    },
                    TurnOutcome::Rejected { message } => StreamEvent::FinalGenerated {
                        message,
                        events: Vec::new(),
                        persisted: self.persisted,
                    },
                    TurnOutcome::AskUser {
                        message,
                        candidates,
                    } => StreamEvent::AskUserData {
                        message,
                        candidates,
                    },
                    TurnOutcome::Failed { message, kind } => {
                        *failure = Some(kind);
                        StreamEvent::error(kind.as_str(), message)
                    }
                };
                if let Some(emitter) = emitter.take() {
                    emitter.finish(event);
                }
                None
            }

            Effect::ScheduleRetry { delay, attempt } => {
                let delay = delay + jitter(delay);
                tracing::info!(
                    conv_id = %self.conversation_id,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying LLM request"
                );
                tokio::time::sleep(delay).await;
                Some(Event::RetryTimeout { attempt })
            }
        }
    }

    async fn persist(&mut self) {
        if let Err(e) = self.store.save(&self.conversation_id, &self.state).await {
            tracing::warn!(conv_id = %self.conversation_id, error = %e, "Failed to persist state");
            self.persisted = false;
        }
    }

    async fn complete(&self, request: &LlmRequest) -> Result<crate::llm::LlmResponse, LlmError> {
        match tokio::time::timeout(self.timeouts.llm, self.llm_client.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::timed_out(self.timeouts.llm)),
        }
    }

    fn llm_error_event(&self, e: LlmError) -> Event {
        let attempt = match &self.state.turn {
            TurnState::Validating { attempt, .. } | TurnState::AgentRequesting { attempt, .. } => {
                *attempt
            }
            _ => 1,
        };
        Event::LlmError {
            message: e.message,
            kind: e.kind,
            attempt,
            retry_after: e.retry_after,
        }
    }

    async fn execute_tool(&self, call: ToolCall) -> Event {
        tracing::info!(conv_id = %self.conversation_id, tool = %call.name, id = %call.id, "Executing tool");
        let start = std::time::Instant::now();
        let cancel = CancellationToken::new();

        let output = tokio::time::timeout(
            self.timeouts.tool,
            self.tool_executor.execute(
                &call.name,
                call.arguments.clone(),
                &self.conversation_id,
                cancel.clone(),
            ),
        )
        .await;

        let result = match output {
            Ok(Some(out)) => ToolResult {
                tool_call_id: call.id.clone(),
                success: out.success,
                output: out.output,
                structured: out.structured,
            },
            Ok(None) => ToolResult::error(&call.id, format!("Unknown tool: {}", call.name)),
            Err(_) => {
                cancel.cancel();
                ToolResult::error(
                    &call.id,
                    format!("Tool timed out after {:?}", self.timeouts.tool),
                )
            }
        };

        tracing::info!(
            conv_id = %self.conversation_id,
            tool = %call.name,
            success = result.success,
            duration_ms = start.elapsed().as_millis(),
            "Tool finished"
        );
        Event::ToolComplete {
            tool_call_id: call.id,
            result,
        }
    }
}

/// Up to a quarter of `delay`, so concurrent retries spread out
fn jitter(delay: Duration) -> Duration {
    let max = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

/// Convert stored dialogue messages to provider messages
pub fn to_llm_messages(messages: &[Message]) -> Vec<LlmMessage> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::System => LlmMessage::system(msg.content.to_text()),
            Role::User => LlmMessage::user(msg.content.to_text()),
            Role::Assistant => {
                let text = msg.content.to_text();
                let mut content = Vec::with_capacity(msg.tool_calls.len() + 1);
                if !text.is_empty() {
                    content.push(ContentBlock::text(text));
                }
                content.extend(
                    msg.tool_calls
                        .iter()
                        .map(|c| ContentBlock::tool_use(&c.id, &c.name, c.arguments.clone())),
                );
                LlmMessage {
                    role: MessageRole::Assistant,
                    content,
                }
            }
            Role::ToolResult => LlmMessage {
                role: MessageRole::User,
                content: vec![ContentBlock::tool_result(
                    msg.tool_call_id.clone().unwrap_or_default(),
                    msg.content.to_text(),
                    msg.is_error,
                )],
            },
        })
        .collect()
}
