//! Property-based tests for the state machine
//!
//! A scripted driver feeds LLM and tool results back into `transition` the
//! way the executor would, so whole turns can be generated.

use super::state::*;
use super::transition::*;
use super::*;
use crate::decoder::DEFAULT_REJECTION;
use crate::llm::LlmErrorKind;
use crate::tools::ToolKind;
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context(validator: bool, budget: u32, mode: BudgetMode) -> TurnContext {
    let settings = TurnSettings {
        validator_enabled: validator,
        tool_budget: budget,
        budget_mode: mode,
        // Keep generated turns linear; suspension has its own unit tests
        contact_disambiguation: false,
        ..TurnSettings::default()
    };
    TurnContext::new("test-conv", settings, "2026-10-16")
}

/// One scripted agent completion: final text, or a batch of tool names
#[derive(Debug, Clone)]
enum Reply {
    Answer(String),
    Calls(Vec<ToolKind>),
}

#[derive(Debug, Default)]
struct Trace {
    budgets: Vec<u32>,
    executed: Vec<String>,
    requested: Vec<String>,
    outcome: Option<TurnOutcome>,
}

/// Run one turn to completion against a script of agent replies
fn drive(
    mut state: ConversationState,
    ctx: &TurnContext,
    verdict: &str,
    script: &[Reply],
) -> (ConversationState, Trace) {
    let mut trace = Trace::default();
    let mut replies = script.iter();
    let mut next_id = 0usize;
    let mut queue = vec![Event::UserMessage {
        text: "what's on my calendar?".to_string(),
    }];

    while let Some(event) = queue.pop() {
        let result = transition(&state, ctx, event).unwrap();
        state = result.new_state;
        trace.budgets.push(state.tool_calls_remaining);

        for effect in result.effects {
            match effect {
                Effect::RequestValidation { .. } => queue.push(Event::ValidatorResponse {
                    text: verdict.to_string(),
                }),
                Effect::RequestAgent { bind_tools, .. } => {
                    let reply = replies
                        .next()
                        .cloned()
                        .unwrap_or_else(|| Reply::Answer("done".into()));
                    let (text, tool_calls) = match reply {
                        Reply::Answer(answer) => (json!({ "response": answer }).to_string(), vec![]),
                        Reply::Calls(kinds) => {
                            let calls: Vec<ToolCall> = kinds
                                .into_iter()
                                .map(|kind| {
                                    next_id += 1;
                                    ToolCall::new(format!("call-{next_id}"), kind.name(), json!({}))
                                })
                                .collect();
                            (String::new(), calls)
                        }
                    };
                    if bind_tools {
                        trace
                            .requested
                            .extend(tool_calls.iter().map(|c| c.id.clone()));
                    }
                    queue.push(Event::AgentResponse { text, tool_calls });
                }
                Effect::ExecuteTool { call } => {
                    trace.executed.push(call.id.clone());
                    queue.push(Event::ToolComplete {
                        tool_call_id: call.id.clone(),
                        result: ToolResult {
                            tool_call_id: call.id,
                            success: true,
                            output: "ok".into(),
                            structured: None,
                        },
                    });
                }
                Effect::Finish(outcome) => trace.outcome = Some(outcome),
                Effect::PersistState | Effect::EmitProgress { .. } | Effect::ScheduleRetry { .. } => {}
            }
        }
    }
    (state, trace)
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_tool_kind() -> impl Strategy<Value = ToolKind> {
    prop::sample::select(ToolKind::ALL.to_vec())
}

fn arb_reply() -> impl Strategy<Value = Reply> {
    prop_oneof![
        1 => "[a-zA-Z ]{0,20}".prop_map(Reply::Answer),
        3 => proptest::collection::vec(arb_tool_kind(), 1..4).prop_map(Reply::Calls),
    ]
}

fn arb_budget_mode() -> impl Strategy<Value = BudgetMode> {
    prop_oneof![Just(BudgetMode::PerBatch), Just(BudgetMode::PerCall)]
}

fn arb_llm_error_kind() -> impl Strategy<Value = LlmErrorKind> {
    prop_oneof![
        Just(LlmErrorKind::Network),
        Just(LlmErrorKind::RateLimit),
        Just(LlmErrorKind::ServerError),
        Just(LlmErrorKind::Auth),
        Just(LlmErrorKind::InvalidRequest),
        Just(LlmErrorKind::TimedOut),
        Just(LlmErrorKind::Unknown),
    ]
}

fn arb_idle_state() -> impl Strategy<Value = TurnState> {
    prop_oneof![
        Just(TurnState::Start),
        Just(TurnState::Done),
        Just(TurnState::Rejected),
        Just(TurnState::Failed {
            message: "earlier failure".into(),
            kind: TurnErrorKind::AgentFailed,
        }),
    ]
}

fn arb_busy_state() -> impl Strategy<Value = TurnState> {
    prop_oneof![
        (1u32..4).prop_map(|attempt| TurnState::Validating {
            attempt,
            pending: vec![Message::user("hi")],
        }),
        (1u32..4, any::<bool>()).prop_map(|(attempt, tools_bound)| TurnState::AgentRequesting {
            attempt,
            pending: vec![],
            tools_bound,
        }),
        "[a-z]{6}".prop_map(|id| TurnState::ToolLoop {
            current: ToolCall::new(id, "get_all_events_tool", json!({})),
            remaining: vec![],
        }),
    ]
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // The budget never grows within a turn and never goes below zero
    #[test]
    fn prop_budget_non_increasing(
        budget in 0u32..6,
        mode in arb_budget_mode(),
        script in proptest::collection::vec(arb_reply(), 0..8)
    ) {
        let ctx = test_context(false, budget, mode);
        let (state, trace) = drive(ConversationState::new(budget), &ctx, "", &script);

        for pair in trace.budgets.windows(2) {
            prop_assert!(pair[1] <= pair[0], "budget grew: {:?}", trace.budgets);
        }
        prop_assert!(state.tool_calls_remaining <= budget);
        prop_assert_eq!(&state.turn, &TurnState::Done);
    }

    // Every requested call runs once, in the order the model listed them,
    // and each gets a result message in the same order
    #[test]
    fn prop_tool_results_follow_call_order(
        budget in 1u32..6,
        script in proptest::collection::vec(arb_reply(), 0..8)
    ) {
        let ctx = test_context(false, budget, BudgetMode::PerBatch);
        let (state, trace) = drive(ConversationState::new(budget), &ctx, "", &script);

        prop_assert_eq!(&trace.executed, &trace.requested);
        let result_ids: Vec<String> = state
            .agent_messages
            .iter()
            .filter(|m| m.role == Role::ToolResult)
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        prop_assert_eq!(result_ids, trace.executed);
    }

    // No more tool batches run than the budget allows
    #[test]
    fn prop_batches_bounded_by_budget(
        budget in 0u32..4,
        script in proptest::collection::vec(arb_reply(), 0..10)
    ) {
        let ctx = test_context(false, budget, BudgetMode::PerBatch);
        let (state, _) = drive(ConversationState::new(budget), &ctx, "", &script);

        let batches = state
            .agent_messages
            .iter()
            .filter(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
            .count();
        prop_assert!(batches <= budget as usize);
    }

    // Per-call budgets bound the number of executed calls, and calls the
    // budget cannot cover still get a result in the order they were listed
    #[test]
    fn prop_per_call_budget_bounds_executions(
        budget in 0u32..5,
        script in proptest::collection::vec(arb_reply(), 0..8)
    ) {
        let ctx = test_context(false, budget, BudgetMode::PerCall);
        let (state, trace) = drive(ConversationState::new(budget), &ctx, "", &script);

        prop_assert!(trace.executed.len() <= budget as usize);
        prop_assert_eq!(state.tool_calls_remaining as usize, budget as usize - trace.executed.len());

        let result_ids: Vec<String> = state
            .agent_messages
            .iter()
            .filter(|m| m.role == Role::ToolResult)
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        prop_assert_eq!(result_ids, trace.requested);
        prop_assert_eq!(&state.turn, &TurnState::Done);
    }

    // A rejected message never reaches the agent or any tool
    #[test]
    fn prop_rejection_leaves_agent_untouched(
        explanation in "[a-zA-Z ]{1,40}",
        script in proptest::collection::vec(arb_reply(), 0..4)
    ) {
        let ctx = test_context(true, 5, BudgetMode::PerBatch);
        let verdict = json!({"valid": false, "response": explanation}).to_string();
        let expected = match explanation.trim() {
            "" => DEFAULT_REJECTION,
            trimmed => trimmed,
        };
        let (state, trace) = drive(ConversationState::new(5), &ctx, &verdict, &script);

        prop_assert!(state.agent_messages.is_empty());
        prop_assert!(trace.executed.is_empty());
        prop_assert!(!state.is_valid_input);
        prop_assert!(
            matches!(
                &trace.outcome,
                Some(TurnOutcome::Rejected { message }) if *message == expected
            ),
            "unexpected outcome {:?}",
            trace.outcome
        );
    }

    // Finished turns always accept the next message
    #[test]
    fn prop_idle_accepts_messages(turn in arb_idle_state(), text in "[a-zA-Z ]{1,30}") {
        let mut state = ConversationState::new(0);
        state.turn = turn;
        let ctx = test_context(true, 5, BudgetMode::PerBatch);

        let result = transition(&state, &ctx, Event::UserMessage { text });
        prop_assert!(result.is_ok(), "idle state rejected message: {:?}", result);
        let result = result.unwrap();
        prop_assert!(
            matches!(result.new_state.turn, TurnState::Validating { attempt: 1, .. }),
            "expected Validating, got {:?}",
            result.new_state.turn
        );
        prop_assert_eq!(result.new_state.tool_calls_remaining, 5);
    }

    #[test]
    fn prop_busy_rejects_messages(turn in arb_busy_state()) {
        let mut state = ConversationState::new(5);
        state.turn = turn;
        let result = transition(
            &state,
            &test_context(true, 5, BudgetMode::PerBatch),
            Event::UserMessage { text: "hi".into() },
        );
        prop_assert!(matches!(result, Err(TransitionError::Busy)), "got {:?}", result);
    }

    // LLM failures either retry with the next attempt or end the turn,
    // and never commit the pending messages
    #[test]
    fn prop_llm_error_retries_or_fails(
        attempt in 1u32..5,
        kind in arb_llm_error_kind(),
        validating in any::<bool>()
    ) {
        let ctx = test_context(true, 5, BudgetMode::PerBatch);
        let mut state = ConversationState::new(5);
        state.turn = if validating {
            TurnState::Validating { attempt, pending: vec![Message::user("hi")] }
        } else {
            TurnState::AgentRequesting { attempt, pending: vec![Message::user("hi")], tools_bound: true }
        };

        let result = transition(
            &state,
            &ctx,
            Event::LlmError { message: "boom".into(), kind, attempt, retry_after: None },
        )
        .unwrap();

        prop_assert!(result.new_state.validator_messages.is_empty());
        prop_assert!(result.new_state.agent_messages.is_empty());
        let retried = result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleRetry { attempt: next, .. } if *next == attempt + 1));
        let failed = matches!(result.new_state.turn, TurnState::Failed { .. });
        prop_assert!(retried != failed);
        prop_assert_eq!(retried, kind.is_retryable() && attempt < ctx.settings.max_attempts);
    }

    // State changes are always persisted
    #[test]
    fn prop_state_changes_persist(
        budget in 1u32..6,
        script in proptest::collection::vec(arb_reply(), 0..6)
    ) {
        let ctx = test_context(true, budget, BudgetMode::PerBatch);
        let mut state = ConversationState::new(budget);
        let result = transition(&state, &ctx, Event::UserMessage { text: "hi".into() }).unwrap();
        prop_assert!(result.effects.iter().any(|e| matches!(e, Effect::PersistState)));
        state = result.new_state;

        let result = transition(
            &state,
            &ctx,
            Event::ValidatorResponse { text: r#"{"valid": true}"#.into() },
        )
        .unwrap();
        prop_assert!(result.new_state != state);
        prop_assert!(result.effects.iter().any(|e| matches!(e, Effect::PersistState)));

        let (_, trace) = drive(ConversationState::new(budget), &ctx, r#"{"valid": true}"#, &script);
        prop_assert!(
            matches!(trace.outcome, Some(TurnOutcome::Answered { .. })),
            "expected an answer, got {:?}",
            trace.outcome
        );
    }
}
