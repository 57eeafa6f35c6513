//! Shared helper for workflow activities
//!
//! Activities never mutate the run snapshot directly. Every effect is an
//! event published through this context; the published copy is folded back
//! into the activity's working state so it reads its own writes, and the
//! projector applies the identical fold to the durable snapshot.

use std::sync::Arc;

use chrono::Utc;
use runway_core::event::{GuardrailTriggeredPayload, ToolRequestedPayload};
use runway_core::{
    event_types, ErrorKind, Event, RetrySchedule, RunState, Step, WorkflowState,
};
use serde_json::{json, Value};

use super::ActivityError;
use crate::bus::EventBus;
use crate::cache::RetrievalCache;
use crate::collab::{Guardrail, GuardrailViolation, ModelStreamer, Planner, Retriever};
use crate::limits::BudgetManager;
use crate::tools::{ToolDescriptor, ToolRegistry};

/// Output is re-chunked for streaming in pieces of this size.
const OUTPUT_CHUNK_SIZE: usize = 64;

/// Collaborators and emit helpers injected into every activity.
pub struct ActivityContext {
    bus: Arc<EventBus>,
    planner: Arc<dyn Planner>,
    retriever: Arc<dyn Retriever>,
    model: Arc<dyn ModelStreamer>,
    guardrail: Arc<dyn Guardrail>,
    registry: Arc<ToolRegistry>,
    budget: Arc<BudgetManager>,
    retrieval_cache: Option<Arc<RetrievalCache>>,
    retries: RetrySchedule,
}

impl ActivityContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        planner: Arc<dyn Planner>,
        retriever: Arc<dyn Retriever>,
        model: Arc<dyn ModelStreamer>,
        guardrail: Arc<dyn Guardrail>,
        registry: Arc<ToolRegistry>,
        budget: Arc<BudgetManager>,
        retrieval_cache: Option<Arc<RetrievalCache>>,
        retries: RetrySchedule,
    ) -> Self {
        Self {
            bus,
            planner,
            retriever,
            model,
            guardrail,
            registry,
            budget,
            retrieval_cache,
            retries,
        }
    }

    pub fn planner(&self) -> &dyn Planner {
        self.planner.as_ref()
    }

    pub fn retriever(&self) -> &dyn Retriever {
        self.retriever.as_ref()
    }

    pub fn model(&self) -> &dyn ModelStreamer {
        self.model.as_ref()
    }

    pub fn guardrail(&self) -> &dyn Guardrail {
        self.guardrail.as_ref()
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.registry.as_ref()
    }

    pub fn budget(&self) -> &BudgetManager {
        self.budget.as_ref()
    }

    pub fn retrieval_cache(&self) -> Option<&RetrievalCache> {
        self.retrieval_cache.as_deref()
    }

    pub fn retries(&self) -> &RetrySchedule {
        &self.retries
    }

    /// Tools visible to the planner. Permission enforcement happens at the
    /// executor; discovery intentionally lists everything registered.
    pub fn discoverable_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.list()
    }

    /// Publish an event stamped with the run's identity and fold it into the
    /// working state.
    pub async fn publish(
        &self,
        state: &mut RunState,
        event: Event,
    ) -> Result<Event, ActivityError> {
        let event = event.with_identity(&state.identity);
        let stored = self.bus.publish(event).await.map_err(|e| {
            ActivityError::fatal(ErrorKind::NetworkFailure, format!("event pipeline: {e}"))
        })?;
        runway_core::apply_event(state, &stored);
        Ok(stored)
    }

    pub async fn emit_status(
        &self,
        state: &mut RunState,
        value: &str,
    ) -> Result<(), ActivityError> {
        self.publish(
            state,
            Event::new(event_types::STATUS_CHANGED, state.run_id.clone(), json!({"value": value})),
        )
        .await
        .map(|_| ())
    }

    pub async fn emit_decision(
        &self,
        state: &mut RunState,
        name: &str,
        value: &str,
        notes: Option<&str>,
    ) -> Result<(), ActivityError> {
        let mut data = json!({"name": name, "value": value});
        if let (Value::Object(map), Some(notes)) = (&mut data, notes) {
            map.insert("notes".to_string(), Value::String(notes.to_string()));
        }
        self.publish(
            state,
            Event::new(event_types::DECISION_MADE, state.run_id.clone(), data),
        )
        .await
        .map(|_| ())
    }

    pub async fn emit_error(
        &self,
        state: &mut RunState,
        node: &str,
        message: &str,
    ) -> Result<(), ActivityError> {
        self.publish(
            state,
            Event::new(
                event_types::ERROR_RAISED,
                state.run_id.clone(),
                json!({"node": node, "message": message}),
            ),
        )
        .await
        .map(|_| ())
    }

    /// Validate text against the output guardrail, then stream it as
    /// `output.chunk` events.
    pub async fn stream_output(
        &self,
        state: &mut RunState,
        text: &str,
    ) -> Result<(), ActivityError> {
        if text.is_empty() {
            return Ok(());
        }
        if let Err(violation) = self.guardrail.check_output(text) {
            return Err(self.record_violation(state, violation).await);
        }
        let chars: Vec<char> = text.chars().collect();
        for piece in chars.chunks(OUTPUT_CHUNK_SIZE) {
            let chunk: String = piece.iter().collect();
            self.publish(
                state,
                Event::new(
                    event_types::OUTPUT_CHUNK,
                    state.run_id.clone(),
                    json!({"text": chunk}),
                ),
            )
            .await?;
        }
        Ok(())
    }

    /// Record a blocking guardrail violation and map it onto the fatal
    /// refusal error the engine expects.
    pub async fn record_violation(
        &self,
        state: &mut RunState,
        violation: GuardrailViolation,
    ) -> ActivityError {
        let payload = GuardrailTriggeredPayload {
            layer: violation.layer,
            threat_type: violation.threat_type,
            reason: violation.reason.clone(),
            blocking: true,
        };
        let publish_result = self
            .publish(
                state,
                Event::from_payload(
                    event_types::GUARDRAIL_TRIGGERED,
                    state.run_id.clone(),
                    &payload,
                ),
            )
            .await;
        match publish_result {
            Ok(_) => ActivityError::fatal(ErrorKind::Refusal, violation.reason),
            Err(err) => err,
        }
    }

    /// Submit a tool request with a deterministic idempotency key derived
    /// from (run, step, attempt), so a crashed-and-replayed submission is
    /// dropped by the executor.
    pub async fn submit_tool_request(
        &self,
        state: &mut RunState,
        workflow: &WorkflowState,
        step: Step,
        tool_name: &str,
        arguments: Value,
    ) -> Result<(), ActivityError> {
        let descriptor = self.registry.descriptor(tool_name).ok_or_else(|| {
            ActivityError::fatal(ErrorKind::BadPlan, format!("planner selected unknown tool {tool_name}"))
        })?;
        let payload = ToolRequestedPayload {
            request_id: format!(
                "{}:{}:{}",
                state.run_id,
                step.as_str(),
                workflow.attempts_for(step)
            ),
            tool_name: descriptor.name.clone(),
            server_id: descriptor.server_id.clone(),
            permission_scope: descriptor.permission_scope.clone(),
            arguments,
            submitted_at: Utc::now(),
        };
        self.publish(
            state,
            Event::from_payload(event_types::TOOL_REQUESTED, state.run_id.clone(), &payload),
        )
        .await
        .map(|_| ())
    }
}
