//! Event-log projection into [`RunState`]
//!
//! The fold is the only code path that mutates a run snapshot. Activities
//! and services publish events; the snapshot evolves by applying them in
//! `seq` order. Replaying a run's full log through [`project`] therefore
//! reproduces the persisted snapshot exactly.
//!
//! Determinism rule: the fold never reads the clock. `updated_at` comes from
//! the event timestamp.

use serde_json::Value;

use crate::event::{event_types, Event};
use crate::state::{
    ChatMode, DecisionRecord, GuardrailRecord, Outcome, RetrievedChunk, RunPhase, RunState,
    ToolRequestRecord, ToolResultRecord, ToolStatus,
};

/// Rebuild a snapshot from scratch by folding the full event history.
pub fn project(run_id: &str, events: &[Event]) -> RunState {
    let mut state = RunState::empty(run_id);
    for event in events {
        apply_event(&mut state, event);
    }
    state
}

/// Fold a single event into the snapshot.
pub fn apply_event(state: &mut RunState, event: &Event) {
    match event.event_type.as_str() {
        event_types::RUN_STARTED => apply_run_started(state, event),
        event_types::NODE_STARTED => {
            if let Some(name) = event.data_str("name") {
                state.phase = phase_for_node(name);
            }
        }
        event_types::DECISION_MADE => apply_decision(state, event),
        event_types::OUTPUT_CHUNK => {
            if let Some(text) = event.data_str("text") {
                state.output_text.push_str(text);
            }
        }
        event_types::RETRIEVAL_COMPLETED => {
            let chunks: Vec<RetrievedChunk> = event
                .data
                .get("chunks")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            state.no_evidence = chunks.is_empty();
            state.retrieved_chunks = chunks;
        }
        event_types::CONTEXT_SANITIZED => {
            let applied = event
                .data
                .get("sanitization_applied")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if applied {
                if let Some(chunk_id) = event.data_str("original_chunk_id") {
                    state.sanitized_chunk_ids.push(chunk_id.to_string());
                }
            }
        }
        event_types::TOOL_REQUESTED => apply_tool_requested(state, event),
        event_types::TOOL_COMPLETED => {
            state.last_tool_status = Some(ToolStatus::Completed);
            state.tool_results.push(ToolResultRecord {
                request_id: request_id_of(event),
                status: ToolStatus::Completed,
                output: event.data.get("output").cloned(),
                error: None,
                duration_ms: duration_of(event),
            });
        }
        event_types::TOOL_FAILED => {
            state.last_tool_status = Some(ToolStatus::Failed);
            state.tool_results.push(ToolResultRecord {
                request_id: request_id_of(event),
                status: ToolStatus::Failed,
                output: None,
                error: event.data.get("error").cloned(),
                duration_ms: duration_of(event),
            });
        }
        event_types::TOOL_DENIED => {
            state.last_tool_status = Some(ToolStatus::Denied);
            state.tool_denied_reason = event.data_str("reason").map(str::to_string);
            state.tool_results.push(ToolResultRecord {
                request_id: request_id_of(event),
                status: ToolStatus::Denied,
                output: None,
                error: event.data.get("reason").cloned(),
                duration_ms: 0,
            });
        }
        event_types::TOOL_SERVER_ERROR => {
            // The terminating tool.failed that follows records the result.
            state.last_tool_status = Some(ToolStatus::ServerError);
        }
        event_types::GUARDRAIL_TRIGGERED => apply_guardrail(state, event),
        event_types::DEGRADED_MODE_ENTERED => {
            state.degraded = true;
        }
        event_types::RUN_COMPLETED => {
            if state.outcome != Some(Outcome::Refusal) {
                state.outcome = Some(Outcome::Success);
            }
            if let Some(reason) = event.data_str("reason") {
                state.verification_reason = Some(reason.to_string());
            }
        }
        event_types::RUN_FAILED => {
            if state.outcome != Some(Outcome::Refusal) {
                state.outcome = Some(Outcome::Failed);
            }
            if let Some(reason) = event.data_str("reason") {
                state.verification_reason = Some(reason.to_string());
            }
        }
        // Remaining vocabulary (status.changed, retrieval.started,
        // tool.discovered, injection.detected, rate.limit.exceeded,
        // error.raised, workflow.*) carries no snapshot fields.
        _ => {}
    }
    state.updated_at = event.ts;
}

fn apply_run_started(state: &mut RunState, event: &Event) {
    if let Some(message) = event.data_str("message") {
        state.message = message.to_string();
    }
    state.context = event.data_str("context").map(str::to_string);
    if let Some(mode) = event.data_str("mode").and_then(ChatMode::parse) {
        state.mode = mode;
    }
    if let Some(tenant) = event.data_str("tenant_id") {
        state.identity.tenant_id = tenant.to_string();
    }
    if let Some(user) = event.data_str("user_id") {
        state.identity.user_id = user.to_string();
    }
    if let Some(limit) = event.data.get("cost_limit").and_then(Value::as_f64) {
        state.cost_limit = limit;
    }
}

fn apply_decision(state: &mut RunState, event: &Event) {
    let name = event.data_str("name").unwrap_or_default().to_string();
    let value = event.data_str("value").unwrap_or_default().to_string();
    let notes = event.data_str("notes").map(str::to_string);

    match name.as_str() {
        "plan_type" => state.plan_type = crate::state::PlanType::parse(&value),
        "verification" => {
            state.verification_passed = Some(value == "pass");
            state.verification_reason = notes.clone();
        }
        "model_cost" => {
            if let Ok(cost) = value.parse::<f64>() {
                state.cost_spent += cost;
            }
        }
        _ => {}
    }

    state.decisions.push(DecisionRecord {
        name,
        value,
        ts: event.ts,
        notes,
    });
}

fn apply_tool_requested(state: &mut RunState, event: &Event) {
    let record = ToolRequestRecord {
        request_id: request_id_of(event),
        tool_name: event.data_str("tool_name").unwrap_or_default().to_string(),
        server_id: event.data_str("server_id").unwrap_or_default().to_string(),
        permission_scope: event
            .data_str("permission_scope")
            .unwrap_or_default()
            .to_string(),
        arguments: event
            .data
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Null),
        submitted_at: event.ts,
    };
    state.requested_tool = Some(record.tool_name.clone());
    state.last_tool_status = Some(ToolStatus::Requested);
    state.tool_requests.push(record);
}

fn apply_guardrail(state: &mut RunState, event: &Event) {
    let reason = event.data_str("reason").unwrap_or_default().to_string();
    let blocking = event
        .data
        .get("blocking")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    state.guardrail = Some(GuardrailRecord {
        status: "guardrail_triggered".to_string(),
        reason: reason.clone(),
        layer: event.data_str("layer").unwrap_or_default().to_string(),
        threat_type: event
            .data_str("threat_type")
            .unwrap_or_default()
            .to_string(),
    });
    if blocking {
        state.outcome = Some(Outcome::Refusal);
        state.verification_passed = Some(false);
        state.verification_reason = Some(reason);
    }
}

fn phase_for_node(name: &str) -> RunPhase {
    match name {
        "receive" => RunPhase::Receive,
        "plan" => RunPhase::Plan,
        "retrieve" => RunPhase::Retrieve,
        "respond" => RunPhase::Respond,
        "verify" => RunPhase::Verify,
        "maybe_approve" => RunPhase::Approval,
        "finalize" => RunPhase::Finalize,
        _ => RunPhase::Init,
    }
}

fn request_id_of(event: &Event) -> String {
    event.data_str("request_id").unwrap_or_default().to_string()
}

fn duration_of(event: &Event) -> u64 {
    event
        .data
        .get("duration_ms")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, data: Value) -> Event {
        Event::new(event_type, "run-1", data)
    }

    #[test]
    fn test_run_started_sets_request_fields() {
        let mut state = RunState::empty("run-1");
        apply_event(
            &mut state,
            &event(
                event_types::RUN_STARTED,
                json!({
                    "message": "what is strategy?",
                    "mode": "answer",
                    "tenant_id": "acme",
                    "user_id": "u-1",
                    "cost_limit": 0.5
                }),
            ),
        );

        assert_eq!(state.message, "what is strategy?");
        assert_eq!(state.mode, ChatMode::Answer);
        assert_eq!(state.identity.tenant_id, "acme");
        assert_eq!(state.cost_limit, 0.5);
    }

    #[test]
    fn test_output_chunks_concatenate() {
        let mut state = RunState::empty("run-1");
        apply_event(&mut state, &event(event_types::OUTPUT_CHUNK, json!({"text": "hel"})));
        apply_event(&mut state, &event(event_types::OUTPUT_CHUNK, json!({"text": "lo"})));
        assert_eq!(state.output_text, "hello");
    }

    #[test]
    fn test_tool_lifecycle_fold() {
        let mut state = RunState::empty("run-1");
        apply_event(
            &mut state,
            &event(
                event_types::TOOL_REQUESTED,
                json!({
                    "request_id": "run-1:plan:1",
                    "tool_name": "calculator",
                    "server_id": "calculator_server",
                    "permission_scope": "calculator.execute",
                    "arguments": {"operation": "add", "a": 17.0, "b": 32.0}
                }),
            ),
        );
        assert!(state.tool_pending());
        assert_eq!(state.requested_tool.as_deref(), Some("calculator"));

        apply_event(
            &mut state,
            &event(
                event_types::TOOL_COMPLETED,
                json!({
                    "request_id": "run-1:plan:1",
                    "tool_name": "calculator",
                    "output": {"result": 49.0},
                    "duration_ms": 3
                }),
            ),
        );
        assert_eq!(state.last_tool_status, Some(ToolStatus::Completed));
        assert_eq!(state.tool_results.len(), 1);
        assert_eq!(
            state.tool_results[0].output,
            Some(json!({"result": 49.0}))
        );
    }

    #[test]
    fn test_denied_tool_records_reason() {
        let mut state = RunState::empty("run-1");
        apply_event(
            &mut state,
            &event(
                event_types::TOOL_DENIED,
                json!({
                    "request_id": "r",
                    "tool_name": "github.list_files",
                    "permission_scope": "github.read",
                    "reason": "scope_not_allowed_environment"
                }),
            ),
        );
        assert_eq!(state.last_tool_status, Some(ToolStatus::Denied));
        assert_eq!(
            state.tool_denied_reason.as_deref(),
            Some("scope_not_allowed_environment")
        );
    }

    #[test]
    fn test_blocking_guardrail_marks_refusal() {
        let mut state = RunState::empty("run-1");
        apply_event(
            &mut state,
            &event(
                event_types::GUARDRAIL_TRIGGERED,
                json!({
                    "layer": "input",
                    "threat_type": "prompt_injection",
                    "reason": "system_instruction_override",
                    "blocking": true
                }),
            ),
        );
        // A later run.failed must not clobber the refusal outcome.
        apply_event(
            &mut state,
            &event(event_types::RUN_FAILED, json!({"reason": "guardrail"})),
        );

        assert_eq!(state.outcome, Some(Outcome::Refusal));
        assert_eq!(state.verification_passed, Some(false));
        assert!(state.verification_reason.is_some());
    }

    #[test]
    fn test_empty_retrieval_sets_no_evidence() {
        let mut state = RunState::empty("run-1");
        apply_event(
            &mut state,
            &event(
                event_types::RETRIEVAL_COMPLETED,
                json!({"number_of_chunks": 0, "chunk_ids": [], "chunks": []}),
            ),
        );
        assert!(state.no_evidence);
        assert!(state.retrieved_chunks.is_empty());
    }

    #[test]
    fn test_model_cost_decision_accumulates() {
        let mut state = RunState::empty("run-1");
        apply_event(
            &mut state,
            &event(
                event_types::DECISION_MADE,
                json!({"name": "model_cost", "value": "0.002"}),
            ),
        );
        apply_event(
            &mut state,
            &event(
                event_types::DECISION_MADE,
                json!({"name": "model_cost", "value": "0.003"}),
            ),
        );
        assert!((state.cost_spent - 0.005).abs() < 1e-9);
        assert_eq!(state.decisions.len(), 2);
    }

    #[test]
    fn test_projection_is_deterministic() {
        let events = vec![
            event(event_types::RUN_STARTED, json!({"message": "hi?", "mode": "answer"})),
            event(event_types::NODE_STARTED, json!({"name": "plan"})),
            event(
                event_types::DECISION_MADE,
                json!({"name": "plan_type", "value": "direct_answer"}),
            ),
            event(event_types::OUTPUT_CHUNK, json!({"text": "answer"})),
            event(event_types::RUN_COMPLETED, json!({"final_text": "answer"})),
        ];

        let a = project("run-1", &events);
        let b = project("run-1", &events);
        assert_eq!(a, b);
        assert_eq!(a.outcome, Some(Outcome::Success));
        assert_eq!(a.phase, RunPhase::Plan);
        assert_eq!(a.plan_type, Some(crate::state::PlanType::DirectAnswer));
    }
}
