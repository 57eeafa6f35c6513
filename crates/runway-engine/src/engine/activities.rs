//! Activity adapters for the fixed pipeline
//!
//! One adapter per step. Each is a function of the projected [`RunState`]
//! plus the injected collaborators; effects flow exclusively through
//! published events so a re-run after crash or retry recomputes from the
//! log instead of duplicating side effects.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use runway_core::event::{
    ContextSanitizedPayload, InjectionDetectedPayload, RateLimitPayload,
    RetrievalCompletedPayload, ToolDiscoveredPayload,
};
use runway_core::{
    event_types, ErrorKind, Event, PlanType, RetrievedChunk, RunState, Step, ToolStatus,
    WorkflowState,
};
use serde_json::{json, Value};
use tracing::info;

use super::{Activity, ActivityContext, ActivityError, StepOutcome};
use crate::cache::RetrievalCache;
use crate::collab::{ModelError, ModelRequest, RetrievalError};

const RETRIEVAL_TOP_K: usize = 3;

fn tool_wait() -> StepOutcome {
    StepOutcome::WaitForEvents {
        event_types: event_types::TOOL_TERMINATORS
            .iter()
            .map(|t| t.to_string())
            .collect(),
        reason: "waiting_for_tool".to_string(),
    }
}

/// Build the full step → activity map.
pub fn build_activities(ctx: Arc<ActivityContext>) -> HashMap<Step, Arc<dyn Activity>> {
    let mut activities: HashMap<Step, Arc<dyn Activity>> = HashMap::new();
    activities.insert(Step::Receive, Arc::new(ReceiveActivity { ctx: ctx.clone() }));
    activities.insert(Step::Plan, Arc::new(PlanActivity { ctx: ctx.clone() }));
    activities.insert(Step::Retrieve, Arc::new(RetrieveActivity { ctx: ctx.clone() }));
    activities.insert(Step::Respond, Arc::new(RespondActivity { ctx: ctx.clone() }));
    activities.insert(Step::Verify, Arc::new(VerifyActivity { ctx: ctx.clone() }));
    activities.insert(
        Step::MaybeApprove,
        Arc::new(MaybeApproveActivity { ctx: ctx.clone() }),
    );
    activities.insert(Step::Finalize, Arc::new(FinalizeActivity { ctx }));
    activities
}

// =============================================================================
// receive
// =============================================================================

struct ReceiveActivity {
    ctx: Arc<ActivityContext>,
}

#[async_trait]
impl Activity for ReceiveActivity {
    async fn execute(
        &self,
        state: &mut RunState,
        _workflow: &mut WorkflowState,
    ) -> Result<StepOutcome, ActivityError> {
        if let Err(violation) = self.ctx.guardrail().check_input(&state.message) {
            return Err(self.ctx.record_violation(state, violation).await);
        }
        info!(
            run_id = %state.run_id,
            message_length = state.message.len(),
            mode = state.mode.as_str(),
            "received run input"
        );
        self.ctx.emit_status(state, "received").await?;
        Ok(StepOutcome::Advance)
    }
}

// =============================================================================
// plan
// =============================================================================

struct PlanActivity {
    ctx: Arc<ActivityContext>,
}

#[async_trait]
impl Activity for PlanActivity {
    async fn execute(
        &self,
        state: &mut RunState,
        workflow: &mut WorkflowState,
    ) -> Result<StepOutcome, ActivityError> {
        self.ctx.emit_status(state, "thinking").await?;

        let tools = self.ctx.discoverable_tools();
        let decision = self
            .ctx
            .planner()
            .plan(state, &tools)
            .await
            .map_err(|e| ActivityError::fatal(ErrorKind::BadPlan, e.to_string()))?;

        self.ctx
            .emit_decision(
                state,
                "plan_type",
                decision.plan_type.as_str(),
                Some(&decision.reason),
            )
            .await?;

        let tool_names: Vec<&str> = tools.iter().map(|d| d.name.as_str()).collect();
        let available = if tool_names.is_empty() {
            "none".to_string()
        } else {
            tool_names.join(", ")
        };
        self.ctx
            .emit_decision(
                state,
                "available_tools",
                &available,
                Some(&format!("{} tool(s) available", tool_names.len())),
            )
            .await?;
        for descriptor in &tools {
            let payload = ToolDiscoveredPayload {
                tool_name: descriptor.name.clone(),
                server_id: descriptor.server_id.clone(),
                permission_scope: descriptor.permission_scope.clone(),
            };
            self.ctx
                .publish(
                    state,
                    Event::from_payload(
                        event_types::TOOL_DISCOVERED,
                        state.run_id.clone(),
                        &payload,
                    ),
                )
                .await?;
        }

        let selected = decision
            .selected_tool
            .as_ref()
            .map(|s| s.tool_name.clone())
            .unwrap_or_else(|| "none".to_string());
        let selection_notes = if decision.selected_tool.is_some() {
            format!("{selected} selected")
        } else {
            "no matching tool".to_string()
        };
        self.ctx
            .emit_decision(state, "tool_selected", &selected, Some(&selection_notes))
            .await?;

        if let Some(selection) = decision.selected_tool {
            let tool_name = selection.tool_name;
            let arguments = selection.arguments;
            let already_requested = state.tool_pending()
                && state.requested_tool.as_deref() == Some(tool_name.as_str());
            if !already_requested {
                self.ctx
                    .submit_tool_request(state, workflow, Step::Plan, &tool_name, arguments)
                    .await?;
                info!(run_id = %state.run_id, tool = %tool_name, "tool requested");
                self.ctx.emit_status(state, "waiting_for_tool").await?;
            }
        }
        Ok(StepOutcome::Advance)
    }
}

// =============================================================================
// retrieve
// =============================================================================

struct RetrieveActivity {
    ctx: Arc<ActivityContext>,
}

#[async_trait]
impl Activity for RetrieveActivity {
    async fn execute(
        &self,
        state: &mut RunState,
        workflow: &mut WorkflowState,
    ) -> Result<StepOutcome, ActivityError> {
        if state.tool_pending() {
            return Ok(tool_wait());
        }

        let mut query = state.message.trim().to_string();
        if let Some(context) = &state.context {
            query.push_str("\n\nContext:\n");
            query.push_str(context.trim());
        }
        self.ctx
            .publish(
                state,
                Event::new(
                    event_types::RETRIEVAL_STARTED,
                    state.run_id.clone(),
                    json!({"query_length": query.len()}),
                ),
            )
            .await?;

        let cache_key = RetrievalCache::key(&state.identity.tenant_id, &query, RETRIEVAL_TOP_K);
        let cached = self
            .ctx
            .retrieval_cache()
            .and_then(|cache| cache.lookup(&cache_key));
        if self.ctx.retrieval_cache().is_some() {
            let cache_status = if cached.is_some() { "hit" } else { "miss" };
            self.ctx
                .emit_decision(state, "retrieval_cache", cache_status, None)
                .await?;
        }

        let chunks = match cached {
            Some(chunks) => chunks,
            None => match self.ctx.retriever().query(&query, RETRIEVAL_TOP_K).await {
                Ok(chunks) => {
                    if !chunks.is_empty() {
                        if let Some(cache) = self.ctx.retrieval_cache() {
                            cache.store(cache_key, chunks.clone());
                        }
                    }
                    chunks
                }
                Err(RetrievalError::Transient(message)) => {
                    let attempt = workflow.attempts_for(Step::Retrieve);
                    let policy = self.ctx.retries().policy_for(Step::Retrieve);
                    if policy.allows(attempt) {
                        return Err(ActivityError::transient(ErrorKind::NetworkFailure, message));
                    }
                    // Attempts exhausted: degrade to an evidence-free answer
                    // instead of failing the run.
                    self.ctx
                        .publish(
                            state,
                            Event::new(
                                event_types::DEGRADED_MODE_ENTERED,
                                state.run_id.clone(),
                                json!({"reason": "retrieval_unavailable"}),
                            ),
                        )
                        .await?;
                    self.ctx.emit_error(state, "retrieve", &message).await?;
                    Vec::new()
                }
            },
        };

        let chunks = self.sanitize(state, chunks).await?;
        let payload = RetrievalCompletedPayload {
            number_of_chunks: chunks.len(),
            chunk_ids: chunks.iter().map(|c| c.chunk_id.clone()).collect(),
            chunks,
        };
        self.ctx
            .publish(
                state,
                Event::from_payload(
                    event_types::RETRIEVAL_COMPLETED,
                    state.run_id.clone(),
                    &payload,
                ),
            )
            .await?;
        self.ctx
            .emit_decision(
                state,
                "retrieval_chunks",
                &payload.number_of_chunks.to_string(),
                Some(&format!("{} chunk(s) retrieved", payload.number_of_chunks)),
            )
            .await?;
        Ok(StepOutcome::Advance)
    }
}

impl RetrieveActivity {
    /// Context-layer guardrails: scan for injected instructions and rewrite
    /// chunks in place before they reach the model.
    async fn sanitize(
        &self,
        state: &mut RunState,
        chunks: Vec<RetrievedChunk>,
    ) -> Result<Vec<RetrievedChunk>, ActivityError> {
        let mut sanitized = Vec::with_capacity(chunks.len());
        for mut chunk in chunks {
            let result = self.ctx.guardrail().sanitize_chunk(&chunk.chunk_id, &chunk.text);
            if let Some(pattern) = result.injection_pattern {
                let payload = InjectionDetectedPayload {
                    location: "retrieval".to_string(),
                    pattern,
                };
                self.ctx
                    .publish(
                        state,
                        Event::from_payload(
                            event_types::INJECTION_DETECTED,
                            state.run_id.clone(),
                            &payload,
                        ),
                    )
                    .await?;
            }
            if result.sanitization_applied {
                let payload = ContextSanitizedPayload {
                    original_chunk_id: chunk.chunk_id.clone(),
                    sanitization_applied: true,
                };
                self.ctx
                    .publish(
                        state,
                        Event::from_payload(
                            event_types::CONTEXT_SANITIZED,
                            state.run_id.clone(),
                            &payload,
                        ),
                    )
                    .await?;
                chunk.text = result.text;
            }
            sanitized.push(chunk);
        }
        Ok(sanitized)
    }
}

// =============================================================================
// respond
// =============================================================================

struct RespondActivity {
    ctx: Arc<ActivityContext>,
}

#[async_trait]
impl Activity for RespondActivity {
    async fn execute(
        &self,
        state: &mut RunState,
        _workflow: &mut WorkflowState,
    ) -> Result<StepOutcome, ActivityError> {
        if state.tool_pending() {
            return Ok(tool_wait());
        }

        let plan = state.plan_type.unwrap_or(PlanType::DirectAnswer);
        let mut strategy = "model_stream";
        let mut notes: Option<String> = None;

        if state.last_tool_status == Some(ToolStatus::Completed) && state.output_text.is_empty() {
            if let Some(summary) = tool_summary_text(state) {
                self.ctx.emit_status(state, "responding").await?;
                self.ctx.stream_output(state, &summary).await?;
            }
            strategy = "tool_summary";
            notes = state.requested_tool.clone();
        } else if state.last_tool_status == Some(ToolStatus::Denied) && state.output_text.is_empty()
        {
            let tool = state.requested_tool.clone().unwrap_or_default();
            let reason = state
                .tool_denied_reason
                .clone()
                .unwrap_or_else(|| "denied".to_string());
            let text = format!("Tool {tool} was denied: {reason}.");
            self.ctx.emit_status(state, "responding").await?;
            self.ctx.stream_output(state, &text).await?;
            strategy = "tool_denied";
            notes = Some(reason);
        } else if plan == PlanType::DirectAnswer {
            if state.output_text.is_empty() {
                let output = self
                    .ctx
                    .model()
                    .generate(ModelRequest {
                        message: &state.message,
                        context: state.context.as_deref(),
                        mode: state.mode,
                        evidence: &state.retrieved_chunks,
                    })
                    .await
                    .map_err(|e| match e {
                        ModelError::Transient(message) => {
                            ActivityError::transient(ErrorKind::NetworkFailure, message)
                        }
                        ModelError::BudgetExhausted => {
                            ActivityError::fatal(ErrorKind::BudgetExhausted, "budget_exhausted")
                        }
                    })?;

                if let Err(exceeded) = self.ctx.budget().record(&state.run_id, output.cost_usd) {
                    let payload = RateLimitPayload {
                        scope: "model_budget".to_string(),
                        reason: "budget_exhausted".to_string(),
                    };
                    self.ctx
                        .publish(
                            state,
                            Event::from_payload(
                                event_types::RATE_LIMIT_EXCEEDED,
                                state.run_id.clone(),
                                &payload,
                            ),
                        )
                        .await?;
                    return Err(ActivityError::fatal(
                        ErrorKind::BudgetExhausted,
                        exceeded.to_string(),
                    ));
                }
                self.ctx
                    .emit_decision(state, "model_cost", &format!("{:.6}", output.cost_usd), None)
                    .await?;
                self.ctx.emit_status(state, "responding").await?;
                self.ctx.stream_output(state, &output.text).await?;
            } else {
                // Re-run after a crash mid-stream: the answer is already in
                // the log, recomputation is a no-op.
                strategy = "resume_existing_output";
            }
        } else if plan == PlanType::NeedsClarification {
            strategy = "clarify_static";
            notes = Some("requesting additional details".to_string());
            let snippet = snippet_of(&state.message);
            let text = format!(
                "Mode {}: I need more details about \"{snippet}\" to continue. \
                 Please clarify so run {} can proceed.",
                state.mode.as_str(),
                state.run_id
            );
            self.ctx.emit_status(state, "responding").await?;
            self.ctx.stream_output(state, &text).await?;
        } else {
            strategy = "refuse_static";
            notes = Some("insufficient or unsafe request".to_string());
            let snippet = snippet_of(&state.message);
            let text = format!(
                "Mode {}: I cannot produce a reliable response for \"{snippet}\". \
                 Run {} must stop here.",
                state.mode.as_str(),
                state.run_id
            );
            self.ctx.emit_status(state, "responding").await?;
            self.ctx.stream_output(state, &text).await?;
        }

        self.ctx
            .emit_decision(state, "response_strategy", strategy, notes.as_deref())
            .await?;
        Ok(StepOutcome::Advance)
    }
}

fn snippet_of(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return "...".to_string();
    }
    trimmed.chars().take(80).collect()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Human-readable summary of the latest tool result.
fn tool_summary_text(state: &RunState) -> Option<String> {
    let result = state.last_tool_result()?;
    let output = result.output.as_ref()?;
    let tool = state.requested_tool.as_deref().unwrap_or("tool");
    if let Some(value) = output.get("result").and_then(Value::as_f64) {
        return Some(format!("The {tool} returned {}.", format_number(value)));
    }
    Some(format!("Tool {tool} completed with output: {output}."))
}

/// Text synthesized when the run ends on a failed tool with no answer.
fn tool_failure_text(state: &RunState) -> Option<String> {
    let result = state.last_tool_result()?;
    if result.status != ToolStatus::Failed {
        return None;
    }
    let tool = state.requested_tool.as_deref().unwrap_or("tool");
    match &result.error {
        Some(error) => Some(format!("Tool {tool} failed: {error}.")),
        None => Some(format!("Tool {tool} failed.")),
    }
}

// =============================================================================
// verify
// =============================================================================

struct VerifyActivity {
    ctx: Arc<ActivityContext>,
}

#[async_trait]
impl Activity for VerifyActivity {
    async fn execute(
        &self,
        state: &mut RunState,
        _workflow: &mut WorkflowState,
    ) -> Result<StepOutcome, ActivityError> {
        let (grounded, grounding_reason) = evaluate_grounding(state);
        self.ctx
            .emit_decision(
                state,
                "grounding",
                if grounded { "pass" } else { "fail" },
                grounding_reason,
            )
            .await?;
        if !grounded {
            let reason = grounding_reason.unwrap_or("missing_citations");
            self.ctx
                .emit_decision(state, "verification", "fail", Some(reason))
                .await?;
            let kind = if reason == "invalid_citation" {
                ErrorKind::InvalidCitation
            } else {
                ErrorKind::MissingCitations
            };
            return Err(ActivityError::fatal(kind, reason));
        }

        let (passed, reason) = evaluate_general(state);
        self.ctx
            .emit_decision(
                state,
                "verification",
                if passed { "pass" } else { "fail" },
                reason,
            )
            .await?;
        info!(run_id = %state.run_id, passed, "verification result");
        Ok(StepOutcome::Advance)
    }
}

/// Citation grounding: required only when retrieval produced evidence.
fn evaluate_grounding(state: &RunState) -> (bool, Option<&'static str>) {
    if state.output_text.is_empty() || state.retrieved_chunks.is_empty() {
        return (true, None);
    }
    static CITATION: OnceLock<Regex> = OnceLock::new();
    let pattern = CITATION
        .get_or_init(|| Regex::new(r"\[([\w\-\.:]+)\]").expect("static pattern compiles"));
    let citations: Vec<&str> = pattern
        .captures_iter(&state.output_text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if citations.is_empty() {
        return (false, Some("missing_citations"));
    }
    let valid: std::collections::HashSet<&str> = state
        .retrieved_chunks
        .iter()
        .map(|c| c.chunk_id.as_str())
        .collect();
    if citations.iter().any(|c| !valid.contains(c)) {
        return (false, Some("invalid_citation"));
    }
    (true, None)
}

fn evaluate_general(state: &RunState) -> (bool, Option<&'static str>) {
    match state.last_tool_status {
        Some(ToolStatus::Completed) => return (true, None),
        Some(ToolStatus::Failed) | Some(ToolStatus::ServerError) => {
            return (false, Some("tool_failed"))
        }
        Some(ToolStatus::Denied) => return (false, Some("permission_denied")),
        _ => {}
    }
    let text = state.output_text.trim();
    if text.is_empty() {
        return (false, Some("empty_output"));
    }
    let lowered = text.to_lowercase();
    if state.plan_type == Some(PlanType::DirectAnswer)
        && (lowered.starts_with("i don't know")
            || lowered.starts_with("cannot")
            || lowered.starts_with("can't"))
    {
        return (false, Some("low_confidence_or_refusal"));
    }
    (true, None)
}

// =============================================================================
// maybe_approve
// =============================================================================

struct MaybeApproveActivity {
    ctx: Arc<ActivityContext>,
}

/// Human review is reserved for content-quality failures it can override;
/// infrastructure denials are not approvable.
fn approval_required(state: &RunState) -> bool {
    if state.verification_passed != Some(false) {
        return false;
    }
    matches!(
        state.verification_reason.as_deref(),
        Some("empty_output") | Some("low_confidence_or_refusal")
    )
}

#[async_trait]
impl Activity for MaybeApproveActivity {
    async fn execute(
        &self,
        state: &mut RunState,
        workflow: &mut WorkflowState,
    ) -> Result<StepOutcome, ActivityError> {
        if !approval_required(state) {
            self.ctx
                .emit_decision(state, "human_approval", "skipped", Some("not_required"))
                .await?;
            return Ok(StepOutcome::Advance);
        }
        match workflow.human_decision.as_deref() {
            Some("approved") => {
                self.ctx
                    .emit_decision(state, "verification", "pass", Some("human_override"))
                    .await?;
                self.ctx
                    .emit_decision(state, "human_approval", "approved", Some("approval_recorded"))
                    .await?;
                Ok(StepOutcome::Advance)
            }
            Some(_) => {
                self.ctx
                    .emit_decision(state, "human_approval", "rejected", Some("approval_recorded"))
                    .await?;
                Err(ActivityError::fatal(ErrorKind::Cancelled, "rejected_by_user"))
            }
            None => Ok(StepOutcome::WaitForApproval {
                reason: "verification_failed".to_string(),
            }),
        }
    }
}

// =============================================================================
// finalize
// =============================================================================

struct FinalizeActivity {
    ctx: Arc<ActivityContext>,
}

#[async_trait]
impl Activity for FinalizeActivity {
    async fn execute(
        &self,
        state: &mut RunState,
        workflow: &mut WorkflowState,
    ) -> Result<StepOutcome, ActivityError> {
        if !state.output_text.is_empty() {
            if let Err(violation) = self.ctx.guardrail().check_output(&state.output_text) {
                return Err(self.ctx.record_violation(state, violation).await);
            }
        }

        let passed = state.verification_passed.unwrap_or(false);
        if !passed && state.output_text.is_empty() {
            if let Some(text) = tool_failure_text(state) {
                self.ctx.stream_output(state, &text).await?;
            }
        }

        let outcome = if passed { "success" } else { "failed" };
        let reason = if passed {
            None
        } else {
            state.verification_reason.clone()
        };
        self.ctx
            .emit_decision(state, "outcome", outcome, reason.as_deref())
            .await?;
        self.ctx.emit_status(state, "complete").await?;
        info!(run_id = %state.run_id, outcome, "run finalized");

        // The engine turns the terminal workflow status into the single
        // run-terminal event.
        if passed {
            workflow.mark_completed();
        } else {
            workflow.mark_failed(json!({
                "error": "verification_failed",
                "reason": reason,
            }));
        }
        Ok(StepOutcome::Advance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_output(output: &str, chunks: Vec<RetrievedChunk>) -> RunState {
        let mut state = RunState::empty("run-1");
        state.output_text = output.to_string();
        state.retrieved_chunks = chunks;
        state
    }

    fn chunk(id: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            document_id: "doc-1".to_string(),
            score: 0.9,
            metadata: json!({}),
            text: "strategy is a plan".to_string(),
        }
    }

    #[test]
    fn test_grounding_passes_without_evidence() {
        let state = state_with_output("an uncited answer", vec![]);
        assert_eq!(evaluate_grounding(&state), (true, None));
    }

    #[test]
    fn test_grounding_requires_citations_with_evidence() {
        let state = state_with_output("an uncited answer", vec![chunk("c-1")]);
        assert_eq!(
            evaluate_grounding(&state),
            (false, Some("missing_citations"))
        );
    }

    #[test]
    fn test_grounding_rejects_unknown_citation() {
        let state = state_with_output("answer [c-2]", vec![chunk("c-1")]);
        assert_eq!(evaluate_grounding(&state), (false, Some("invalid_citation")));
    }

    #[test]
    fn test_grounding_accepts_valid_citation() {
        let state = state_with_output("answer [c-1]", vec![chunk("c-1")]);
        assert_eq!(evaluate_grounding(&state), (true, None));
    }

    #[test]
    fn test_general_verification_flags_empty_output() {
        let state = state_with_output("", vec![]);
        assert_eq!(evaluate_general(&state), (false, Some("empty_output")));
    }

    #[test]
    fn test_general_verification_flags_denied_tool() {
        let mut state = state_with_output("text", vec![]);
        state.last_tool_status = Some(ToolStatus::Denied);
        assert_eq!(evaluate_general(&state), (false, Some("permission_denied")));
    }

    #[test]
    fn test_tool_summary_formats_integral_result() {
        let mut state = RunState::empty("run-1");
        state.requested_tool = Some("calculator".to_string());
        state.tool_results.push(runway_core::ToolResultRecord {
            request_id: "r".to_string(),
            status: ToolStatus::Completed,
            output: Some(json!({"result": 49.0})),
            error: None,
            duration_ms: 2,
        });
        assert_eq!(
            tool_summary_text(&state),
            Some("The calculator returned 49.".to_string())
        );
    }

    #[test]
    fn test_approval_only_for_overridable_failures() {
        let mut state = RunState::empty("run-1");
        state.verification_passed = Some(false);
        state.verification_reason = Some("empty_output".to_string());
        assert!(approval_required(&state));

        state.verification_reason = Some("permission_denied".to_string());
        assert!(!approval_required(&state));

        state.verification_passed = Some(true);
        state.verification_reason = Some("empty_output".to_string());
        assert!(!approval_required(&state));
    }
}
