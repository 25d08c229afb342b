//! Pure state transition function
//!
//! Given the persisted conversation, the turn context and one event, decide
//! the next state and the effects the runtime must perform. No I/O happens
//! here; LLM and tool results arrive as events.

use super::effect::TurnOutcome;
use super::state::{
    BudgetMode, Checkpoint, ContactMatch, ConversationState, Message, Role, ToolCall, ToolResult,
    TurnContext, TurnErrorKind, TurnState, ValidatorWindow,
};
use super::{Effect, Event};
use crate::decoder::{decode_agent_answer, decode_validator};
use crate::llm::LlmErrorKind;
use crate::system_prompt::{agent_human_turn, agent_prompt, validator_prompt};
use crate::tools::ToolKind;
use serde_json::json;
use std::fmt::Write;
use std::time::Duration;
use thiserror::Error;

/// Answer used when the model ends a turn with no text at all
pub const EMPTY_ANSWER: &str = "I'm sorry, I wasn't able to put together an answer. Could you rephrase your request?";

/// Result text for a call the per-call budget could not cover
pub const BUDGET_EXHAUSTED: &str = "Tool call budget exhausted";

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConversationState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConversationState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("A turn is already in progress for this conversation")]
    Busy,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
#[allow(clippy::too_many_lines)]
pub fn transition(
    state: &ConversationState,
    ctx: &TurnContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (&state.turn, event) {
        // ============================================================
        // Turn entry
        // ============================================================
        (
            TurnState::Start | TurnState::Done | TurnState::Rejected | TurnState::Failed { .. },
            Event::UserMessage { text },
        ) => Ok(begin_turn(state, ctx, text)),

        (TurnState::Suspended { checkpoint }, Event::UserMessage { text }) => {
            Ok(resume(state, ctx, checkpoint, text))
        }

        (turn, Event::UserMessage { .. }) if turn.is_busy() => Err(TransitionError::Busy),

        // ============================================================
        // Validation
        // ============================================================
        (TurnState::Validating { pending, .. }, Event::ValidatorResponse { text }) => {
            Ok(on_verdict(state, ctx, pending, &text))
        }

        (
            TurnState::Validating { attempt, pending },
            Event::LlmError {
                message,
                kind,
                attempt: failed,
                retry_after,
            },
        ) if failed == *attempt => {
            if should_retry(ctx, kind, *attempt) {
                let mut next = state.clone();
                next.turn = TurnState::Validating {
                    attempt: attempt + 1,
                    pending: pending.clone(),
                };
                Ok(schedule_retry(next, ctx, attempt + 1, retry_after))
            } else {
                Ok(fail_turn(
                    state,
                    TurnErrorKind::ValidationFailed,
                    describe_llm_failure(&message, kind, *attempt),
                ))
            }
        }

        (TurnState::Validating { attempt, pending }, Event::RetryTimeout { attempt: retry })
            if retry == *attempt =>
        {
            let messages = validator_request(
                &state.validator_messages,
                pending,
                ctx.settings.validator_window,
            );
            Ok(TransitionResult::new(state.clone())
                .with_effect(Effect::RequestValidation { messages }))
        }

        // ============================================================
        // Agent step
        // ============================================================
        (
            TurnState::AgentRequesting {
                pending,
                tools_bound,
                ..
            },
            Event::AgentResponse { text, tool_calls },
        ) => Ok(on_agent_response(
            state,
            ctx,
            pending,
            *tools_bound,
            text,
            tool_calls,
        )),

        (
            TurnState::AgentRequesting {
                attempt,
                pending,
                tools_bound,
            },
            Event::LlmError {
                message,
                kind,
                attempt: failed,
                retry_after,
            },
        ) if failed == *attempt => {
            if should_retry(ctx, kind, *attempt) {
                let mut next = state.clone();
                next.turn = TurnState::AgentRequesting {
                    attempt: attempt + 1,
                    pending: pending.clone(),
                    tools_bound: *tools_bound,
                };
                Ok(schedule_retry(next, ctx, attempt + 1, retry_after))
            } else {
                Ok(fail_turn(
                    state,
                    TurnErrorKind::AgentFailed,
                    describe_llm_failure(&message, kind, *attempt),
                ))
            }
        }

        (
            TurnState::AgentRequesting {
                attempt,
                pending,
                tools_bound,
            },
            Event::RetryTimeout { attempt: retry },
        ) if retry == *attempt => {
            let messages = state.agent_messages.iter().chain(pending).cloned().collect();
            Ok(
                TransitionResult::new(state.clone()).with_effect(Effect::RequestAgent {
                    messages,
                    bind_tools: *tools_bound,
                }),
            )
        }

        // ============================================================
        // Tool loop
        // ============================================================
        (
            TurnState::ToolLoop { current, remaining },
            Event::ToolComplete {
                tool_call_id,
                result,
            },
        ) if tool_call_id == current.id => Ok(on_tool_complete(state, ctx, current, remaining, result)),

        (turn, event) => Err(TransitionError::InvalidTransition(format!(
            "{} cannot handle {event:?}",
            turn.name()
        ))),
    }
}

// ============================================================================
// Step helpers
// ============================================================================

fn begin_turn(state: &ConversationState, ctx: &TurnContext, text: String) -> TransitionResult {
    let mut next = state.clone();
    next.user_message.clone_from(&text);
    next.response = None;
    next.is_valid_input = true;
    next.tool_calls_remaining = ctx.settings.tool_budget;
    next.pending_contact_matches.clear();

    if !ctx.settings.validator_enabled {
        return begin_agent_step(next, ctx);
    }

    let mut pending = Vec::new();
    if next.validator_messages.is_empty() {
        pending.push(Message::system(validator_prompt()));
    }
    pending.push(Message::user(text));

    let messages = validator_request(
        &next.validator_messages,
        &pending,
        ctx.settings.validator_window,
    );
    next.turn = TurnState::Validating {
        attempt: 1,
        pending,
    };

    TransitionResult::new(next)
        .with_effect(Effect::PersistState)
        .with_effect(Effect::RequestValidation { messages })
}

fn on_verdict(
    state: &ConversationState,
    ctx: &TurnContext,
    pending: &[Message],
    text: &str,
) -> TransitionResult {
    let decision = match decode_validator(text) {
        Ok(d) => d,
        Err(e) => return fail_turn(state, TurnErrorKind::ValidationDecode, e.to_string()),
    };

    let mut next = state.clone();
    next.validator_messages.extend_from_slice(pending);
    next.validator_messages.push(Message::assistant(
        serde_json::to_string(&decision).unwrap_or_else(|_| text.to_string()),
    ));
    next.is_valid_input = decision.valid;

    if decision.valid {
        return begin_agent_step(next, ctx);
    }

    let explanation = decision.explanation();
    next.response = Some(explanation.clone());
    next.turn = TurnState::Rejected;

    TransitionResult::new(next)
        .with_effect(Effect::PersistState)
        .with_effect(Effect::Finish(TurnOutcome::Rejected {
            message: explanation,
        }))
}

fn begin_agent_step(mut next: ConversationState, ctx: &TurnContext) -> TransitionResult {
    let mut pending = Vec::new();
    if next.agent_messages.is_empty() {
        pending.push(Message::system(agent_prompt(
            &ctx.today,
            &ctx.settings.timezone,
        )));
    }
    pending.push(Message::user(agent_human_turn(
        &next.user_message,
        next.tool_calls_remaining,
    )));

    // An exhausted budget withholds tools, forcing a textual answer
    let tools_bound = next.tool_calls_remaining > 0 && !ctx.settings.tools.is_empty();
    let messages = next.agent_messages.iter().chain(&pending).cloned().collect();
    next.turn = TurnState::AgentRequesting {
        attempt: 1,
        pending,
        tools_bound,
    };

    TransitionResult::new(next)
        .with_effect(Effect::PersistState)
        .with_effect(Effect::RequestAgent {
            messages,
            bind_tools: tools_bound,
        })
}

fn on_agent_response(
    state: &ConversationState,
    ctx: &TurnContext,
    pending: &[Message],
    tools_bound: bool,
    text: String,
    tool_calls: Vec<ToolCall>,
) -> TransitionResult {
    // Tool calls from an unbound completion are ignored; the text is final
    let calls = if tools_bound { tool_calls } else { Vec::new() };

    if let Some(unknown) = calls.iter().find(|c| !ctx.is_bound(&c.name)) {
        return fail_turn(
            state,
            TurnErrorKind::UnknownTool,
            format!("Model requested unknown tool '{}'", unknown.name),
        );
    }

    let mut next = state.clone();
    next.agent_messages.extend_from_slice(pending);

    let mut calls = calls.into_iter();
    let Some(first) = calls.next() else {
        let mut answer = decode_agent_answer(&text);
        if answer.response.trim().is_empty() {
            answer.response = EMPTY_ANSWER.to_string();
        }
        next.agent_messages.push(Message::assistant(text));
        next.response = Some(answer.response.clone());
        next.turn = TurnState::Done;

        return TransitionResult::new(next)
            .with_effect(Effect::PersistState)
            .with_effect(Effect::Finish(TurnOutcome::Answered {
                message: answer.response,
                events: answer.events,
            }));
    };

    // Per-call budgets are charged as each call is dispatched
    if ctx.settings.budget_mode == BudgetMode::PerBatch {
        next.tool_calls_remaining = next.tool_calls_remaining.saturating_sub(1);
    }

    let mut batch = vec![first];
    batch.extend(calls);
    next.agent_messages
        .push(Message::assistant_with_tools(text, batch.clone()));
    next.response = Some(String::new());

    continue_batch(next, ctx, batch)
}

/// Enter the tool loop for `current`, announcing it first when it has a label
fn dispatch(
    mut next: ConversationState,
    current: ToolCall,
    remaining: Vec<ToolCall>,
) -> TransitionResult {
    let label = ToolKind::from_name(&current.name).map(ToolKind::progress_label);
    next.turn = TurnState::ToolLoop {
        current: current.clone(),
        remaining,
    };

    TransitionResult::new(next)
        .with_effect(Effect::PersistState)
        .with_effects(label.map(Effect::progress))
        .with_effect(Effect::ExecuteTool { call: current })
}

/// Dispatch the next call of the batch. In per-call mode a call beyond the
/// budget gets an error result instead of running.
fn continue_batch(
    mut next: ConversationState,
    ctx: &TurnContext,
    remaining: Vec<ToolCall>,
) -> TransitionResult {
    let mut remaining = remaining.into_iter();
    loop {
        let Some(current) = remaining.next() else {
            return begin_agent_step(next, ctx);
        };
        if ctx.settings.budget_mode == BudgetMode::PerCall {
            if next.tool_calls_remaining == 0 {
                let skipped = ToolResult::error(current.id, BUDGET_EXHAUSTED);
                next.agent_messages.push(Message::tool_result(&skipped));
                continue;
            }
            next.tool_calls_remaining -= 1;
        }
        return dispatch(next, current, remaining.collect());
    }
}

fn on_tool_complete(
    state: &ConversationState,
    ctx: &TurnContext,
    current: &ToolCall,
    remaining: &[ToolCall],
    result: ToolResult,
) -> TransitionResult {
    let mut next = state.clone();

    if ctx.settings.contact_disambiguation
        && current.name == ToolKind::FindSimilarContacts.name()
        && result.success
    {
        let matches = contact_matches(&result);
        if matches.len() >= 2 {
            let question = contact_question(current, &matches);
            next.pending_contact_matches.clone_from(&matches);
            next.turn = TurnState::Suspended {
                checkpoint: Checkpoint::ContactChoice {
                    call: current.clone(),
                    result,
                    remaining: remaining.to_vec(),
                },
            };
            return TransitionResult::new(next)
                .with_effect(Effect::PersistState)
                .with_effect(Effect::Finish(TurnOutcome::AskUser {
                    message: question,
                    candidates: matches,
                }));
        }
    }

    next.agent_messages.push(Message::tool_result(&result));
    continue_batch(next, ctx, remaining.to_vec())
}

fn resume(
    state: &ConversationState,
    ctx: &TurnContext,
    checkpoint: &Checkpoint,
    text: String,
) -> TransitionResult {
    let Checkpoint::ContactChoice {
        result, remaining, ..
    } = checkpoint;

    let mut next = state.clone();
    let selection = resolve_contact_choice(&text, &state.pending_contact_matches);
    let resolved = annotate_choice(result, selection, &text);

    next.agent_messages.push(Message::tool_result(&resolved));
    next.pending_contact_matches.clear();
    next.user_message = text;

    continue_batch(next, ctx, remaining.clone())
}

fn fail_turn(state: &ConversationState, kind: TurnErrorKind, detail: String) -> TransitionResult {
    let mut next = state.clone();
    next.turn = TurnState::Failed {
        message: detail,
        kind,
    };
    TransitionResult::new(next)
        .with_effect(Effect::PersistState)
        .with_effect(Effect::fail(kind))
}

fn should_retry(ctx: &TurnContext, kind: LlmErrorKind, attempt: u32) -> bool {
    kind.is_retryable() && attempt < ctx.settings.max_attempts
}

fn schedule_retry(
    next: ConversationState,
    ctx: &TurnContext,
    attempt: u32,
    retry_after: Option<Duration>,
) -> TransitionResult {
    let backoff = retry_delay(ctx.settings.retry_base, attempt);
    let delay = retry_after.map_or(backoff, |after| after.max(backoff));
    TransitionResult::new(next)
        .with_effect(Effect::PersistState)
        .with_effect(Effect::ScheduleRetry { delay, attempt })
}

/// Exponential backoff: base, 2*base, 4*base ... capped
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2).min(16);
    base.saturating_mul(1 << exponent).min(MAX_RETRY_DELAY)
}

fn describe_llm_failure(message: &str, kind: LlmErrorKind, attempt: u32) -> String {
    if kind.is_retryable() {
        format!("Failed after {attempt} attempts: {message}")
    } else {
        message.to_string()
    }
}

/// Messages sent to the validator: the system prompt, a window of prior
/// exchanges and the pending turn. The stored history is never truncated.
fn validator_request(
    history: &[Message],
    pending: &[Message],
    window: ValidatorWindow,
) -> Vec<Message> {
    let mut messages = match window {
        ValidatorWindow::Full => history.to_vec(),
        ValidatorWindow::LastExchanges(n) => {
            let (system, rest) = match history.split_first() {
                Some((first, rest)) if first.role == Role::System => (Some(first), rest),
                _ => (None, history),
            };
            let keep = rest.len().min(n.saturating_mul(2));
            system
                .into_iter()
                .chain(rest.iter().skip(rest.len() - keep))
                .cloned()
                .collect()
        }
    };
    messages.extend_from_slice(pending);
    messages
}

// ============================================================================
// Contact disambiguation
// ============================================================================

fn contact_matches(result: &ToolResult) -> Vec<ContactMatch> {
    result
        .structured
        .clone()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

fn contact_question(call: &ToolCall, matches: &[ContactMatch]) -> String {
    let name = call
        .arguments
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("that name");
    let mut question = format!("I found several contacts matching \"{name}\":");
    for (i, m) in matches.iter().enumerate() {
        let _ = write!(question, "\n{}. {} <{}>", i + 1, m.display_name, m.address);
    }
    question.push_str("\nWhich one did you mean?");
    question
}

/// Match a reply against the candidates by 1-based index, address or name.
pub fn resolve_contact_choice<'a>(
    reply: &str,
    candidates: &'a [ContactMatch],
) -> Option<&'a ContactMatch> {
    let reply = reply.trim();
    let digits = reply.trim_matches(|c: char| !c.is_ascii_digit());
    if let Ok(index) = digits.parse::<usize>() {
        if digits.len() == reply.trim_end_matches(['.', ')']).trim_start_matches('#').len() {
            return index.checked_sub(1).and_then(|i| candidates.get(i));
        }
    }

    // Addresses only match whole tokens so "ann@x" never claims "joann@x"
    let by_address = reply
        .split(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | ',' | ';'))
        .map(|token| token.trim_matches(|c: char| matches!(c, '.' | '"' | '\'' | '(' | ')')))
        .filter(|token| !token.is_empty())
        .find_map(|token| {
            candidates
                .iter()
                .find(|c| c.address.eq_ignore_ascii_case(token))
        });
    if by_address.is_some() {
        return by_address;
    }

    let lowered = reply.to_lowercase();

    // Longest matching name wins so "John Smith" beats "John"
    candidates
        .iter()
        .filter(|c| lowered.contains(&c.display_name.to_lowercase()))
        .max_by_key(|c| c.display_name.len())
}

fn annotate_choice(result: &ToolResult, selection: Option<&ContactMatch>, reply: &str) -> ToolResult {
    let mut resolved = result.clone();
    match selection {
        Some(choice) => {
            let _ = write!(
                resolved.output,
                "\nUser selected: {} <{}>",
                choice.display_name, choice.address
            );
        }
        None => {
            let _ = write!(resolved.output, "\nUser replied: {reply}");
        }
    }
    resolved.structured = Some(json!({
        "matches": result.structured,
        "selected": selection,
    }));
    resolved
}
