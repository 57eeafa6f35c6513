//! Collaborator interfaces consumed by the activity adapters
//!
//! The engine treats planning, retrieval, model generation, and guardrails
//! as injected abstractions. Failures are pre-classified by the trait
//! contracts so activities can map them onto the engine's transient/fatal
//! taxonomy without guessing.

use async_trait::async_trait;
use runway_core::{ChatMode, PlanType, RetrievedChunk, RunState};
use serde_json::Value;

use crate::tools::ToolDescriptor;

/// A concrete tool invocation proposed by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSelection {
    pub tool_name: String,
    pub arguments: Value,
}

/// Outcome of the planning collaborator.
#[derive(Debug, Clone)]
pub struct PlanDecision {
    pub plan_type: PlanType,
    pub reason: String,
    pub selected_tool: Option<ToolSelection>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The planner produced an inconsistent decision. Fatal.
    #[error("bad plan: {0}")]
    BadPlan(String),
}

#[async_trait]
pub trait Planner: Send + Sync + 'static {
    async fn plan(
        &self,
        state: &RunState,
        allowed_tools: &[ToolDescriptor],
    ) -> Result<PlanDecision, PlanError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// Store unreachable or overloaded. Retried per policy; repeated failure
    /// degrades the run instead of failing it.
    #[error("retrieval unavailable: {0}")]
    Transient(String),
}

#[async_trait]
pub trait Retriever: Send + Sync + 'static {
    async fn query(&self, query: &str, top_k: usize)
        -> Result<Vec<RetrievedChunk>, RetrievalError>;
}

/// Prompt inputs for a model turn.
#[derive(Debug, Clone)]
pub struct ModelRequest<'a> {
    pub message: &'a str,
    pub context: Option<&'a str>,
    pub mode: ChatMode,
    pub evidence: &'a [RetrievedChunk],
}

/// A full model turn: generated text plus its metered cost.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub text: String,
    pub cost_usd: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model call failed: {0}")]
    Transient(String),

    #[error("model budget exhausted")]
    BudgetExhausted,
}

#[async_trait]
pub trait ModelStreamer: Send + Sync + 'static {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelOutput, ModelError>;
}

/// A guardrail refusal with enough structure for events and the snapshot.
#[derive(Debug, Clone, thiserror::Error)]
#[error("guardrail triggered at {layer}: {reason}")]
pub struct GuardrailViolation {
    pub layer: String,
    pub threat_type: String,
    pub reason: String,
}

/// Result of sanitizing one retrieved chunk.
#[derive(Debug, Clone)]
pub struct SanitizedChunk {
    pub text: String,
    pub sanitization_applied: bool,
    /// Pattern matched by the injection scan, if any. Signal only.
    pub injection_pattern: Option<String>,
}

/// Layered safety checks. Input and output refusals are blocking; context
/// sanitization rewrites evidence in place and only signals.
pub trait Guardrail: Send + Sync + 'static {
    fn check_input(&self, message: &str) -> Result<(), GuardrailViolation>;
    fn sanitize_chunk(&self, chunk_id: &str, text: &str) -> SanitizedChunk;
    fn check_output(&self, text: &str) -> Result<(), GuardrailViolation>;
}

/// Guardrail that passes everything through; used when layers are disabled.
pub struct NoopGuardrail;

impl Guardrail for NoopGuardrail {
    fn check_input(&self, _message: &str) -> Result<(), GuardrailViolation> {
        Ok(())
    }

    fn sanitize_chunk(&self, _chunk_id: &str, text: &str) -> SanitizedChunk {
        SanitizedChunk {
            text: text.to_string(),
            sanitization_applied: false,
            injection_pattern: None,
        }
    }

    fn check_output(&self, _text: &str) -> Result<(), GuardrailViolation> {
        Ok(())
    }
}
