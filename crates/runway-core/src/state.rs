//! Run snapshot types
//!
//! [`RunState`] is the materialized view of a single run. It is a cache: the
//! event log owns historical truth and the snapshot is rebuilt by folding
//! events (see [`crate::projection`]). Nothing mutates a snapshot except the
//! fold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Identity;

/// Supported operation modes for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    Answer,
    Research,
    Summarize,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answer => "answer",
            Self::Research => "research",
            Self::Summarize => "summarize",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "answer" => Some(Self::Answer),
            "research" => Some(Self::Research),
            "summarize" => Some(Self::Summarize),
            _ => None,
        }
    }
}

/// High-level plan classification choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    DirectAnswer,
    NeedsClarification,
    CannotAnswer,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectAnswer => "direct_answer",
            Self::NeedsClarification => "needs_clarification",
            Self::CannotAnswer => "cannot_answer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "direct_answer" => Some(Self::DirectAnswer),
            "needs_clarification" => Some(Self::NeedsClarification),
            "cannot_answer" => Some(Self::CannotAnswer),
            _ => None,
        }
    }
}

/// Named phases of the fixed pipeline, mirrored from `node.started` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Receive,
    Plan,
    Retrieve,
    Respond,
    Verify,
    Approval,
    Finalize,
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Refusal,
}

/// Lifecycle status of the most recent tool request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Requested,
    Completed,
    Failed,
    Denied,
    ServerError,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Denied => "denied",
            Self::ServerError => "server_error",
        }
    }
}

/// Structured entry describing a single decision made during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub name: String,
    pub value: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A retrieved evidence chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Value,
    pub text: String,
}

/// A tool request submitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequestRecord {
    pub request_id: String,
    pub tool_name: String,
    pub server_id: String,
    pub permission_scope: String,
    pub arguments: Value,
    pub submitted_at: DateTime<Utc>,
}

/// The resolution of a tool request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub request_id: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Guardrail verdict recorded on the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailRecord {
    pub status: String,
    pub reason: String,
    pub layer: String,
    pub threat_type: String,
}

/// Materialized snapshot of a run, derived deterministically from its event
/// log prefix. The stored JSON document is a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub mode: ChatMode,
    pub identity: Identity,
    pub phase: RunPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<PlanType>,
    #[serde(default)]
    pub decisions: Vec<DecisionRecord>,
    #[serde(default)]
    pub tool_requests: Vec<ToolRequestRecord>,
    #[serde(default)]
    pub tool_results: Vec<ToolResultRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tool_status: Option<ToolStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_denied_reason: Option<String>,
    #[serde(default)]
    pub retrieved_chunks: Vec<RetrievedChunk>,
    #[serde(default)]
    pub sanitized_chunk_ids: Vec<String>,
    #[serde(default)]
    pub no_evidence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<GuardrailRecord>,
    #[serde(default)]
    pub output_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_reason: Option<String>,
    #[serde(default)]
    pub cost_spent: f64,
    #[serde(default)]
    pub cost_limit: f64,
    #[serde(default)]
    pub degraded: bool,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Empty snapshot used as the fold seed.
    pub fn empty(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            message: String::new(),
            context: None,
            mode: ChatMode::Answer,
            identity: Identity::default(),
            phase: RunPhase::Init,
            plan_type: None,
            decisions: Vec::new(),
            tool_requests: Vec::new(),
            tool_results: Vec::new(),
            requested_tool: None,
            last_tool_status: None,
            tool_denied_reason: None,
            retrieved_chunks: Vec::new(),
            sanitized_chunk_ids: Vec::new(),
            no_evidence: false,
            guardrail: None,
            output_text: String::new(),
            outcome: None,
            verification_passed: None,
            verification_reason: None,
            cost_spent: 0.0,
            cost_limit: 0.0,
            degraded: false,
            updated_at: Utc::now(),
        }
    }

    /// Whether a tool request is outstanding and unresolved.
    pub fn tool_pending(&self) -> bool {
        matches!(self.last_tool_status, Some(ToolStatus::Requested))
    }

    /// The most recent tool request, if any.
    pub fn current_tool_request(&self) -> Option<&ToolRequestRecord> {
        self.tool_requests.last()
    }

    /// The most recent tool result, if any.
    pub fn last_tool_result(&self) -> Option<&ToolResultRecord> {
        self.tool_results.last()
    }

    /// Whether the run has reached a terminal outcome.
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(ChatMode::parse("answer"), Some(ChatMode::Answer));
        assert_eq!(ChatMode::parse("research"), Some(ChatMode::Research));
        assert_eq!(ChatMode::parse("nope"), None);
    }

    #[test]
    fn test_empty_state_has_no_pending_tool() {
        let state = RunState::empty("run-1");
        assert!(!state.tool_pending());
        assert!(state.current_tool_request().is_none());
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = RunState::empty("run-1");
        state.message = "what is strategy?".to_string();
        state.last_tool_status = Some(ToolStatus::Completed);
        state.outcome = Some(Outcome::Success);

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: RunState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(state, decoded);
    }
}
