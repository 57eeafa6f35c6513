//! Event envelope and the closed event-type vocabulary
//!
//! Every significant transition in a run is recorded as an [`Event`]: an
//! immutable, per-run sequenced fact. The event log is the only source of
//! historical truth; run snapshots and workflow records are caches derived
//! from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of event types a run can emit.
///
/// Consumers match on these constants; unknown types are never produced by
/// this crate.
pub mod event_types {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";

    pub const NODE_STARTED: &str = "node.started";
    pub const NODE_COMPLETED: &str = "node.completed";
    pub const STATUS_CHANGED: &str = "status.changed";
    pub const DECISION_MADE: &str = "decision.made";
    pub const OUTPUT_CHUNK: &str = "output.chunk";

    pub const RETRIEVAL_STARTED: &str = "retrieval.started";
    pub const RETRIEVAL_COMPLETED: &str = "retrieval.completed";

    pub const TOOL_DISCOVERED: &str = "tool.discovered";
    pub const TOOL_REQUESTED: &str = "tool.requested";
    pub const TOOL_COMPLETED: &str = "tool.completed";
    pub const TOOL_FAILED: &str = "tool.failed";
    pub const TOOL_DENIED: &str = "tool.denied";
    pub const TOOL_SERVER_ERROR: &str = "tool.server.error";

    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_STEP_STARTED: &str = "workflow.step.started";
    pub const WORKFLOW_STEP_COMPLETED: &str = "workflow.step.completed";
    pub const WORKFLOW_RETRYING: &str = "workflow.retrying";
    pub const WORKFLOW_WAITING_FOR_EVENT: &str = "workflow.waiting_for_event";
    pub const WORKFLOW_WAITING_FOR_APPROVAL: &str = "workflow.waiting_for_approval";
    pub const WORKFLOW_APPROVAL_RECORDED: &str = "workflow.approval.recorded";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";

    pub const GUARDRAIL_TRIGGERED: &str = "guardrail.triggered";
    pub const CONTEXT_SANITIZED: &str = "context.sanitized";
    pub const INJECTION_DETECTED: &str = "injection.detected";

    pub const RATE_LIMIT_EXCEEDED: &str = "rate.limit.exceeded";
    pub const DEGRADED_MODE_ENTERED: &str = "degraded.mode.entered";
    pub const ERROR_RAISED: &str = "error.raised";

    /// Event types that are resolved tool terminators for a pending request.
    pub const TOOL_TERMINATORS: [&str; 4] =
        [TOOL_COMPLETED, TOOL_FAILED, TOOL_DENIED, TOOL_SERVER_ERROR];
}

/// Durable event structure stored per run.
///
/// `seq` starts at zero when the event is built and is assigned by the event
/// store on append; a stored event always carries `seq >= 1`, gapless and
/// unique within its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub run_id: String,
    #[serde(default)]
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Event {
    /// Create a fresh, unsequenced event.
    pub fn new(event_type: impl Into<String>, run_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            run_id: run_id.into(),
            seq: 0,
            ts: Utc::now(),
            event_type: event_type.into(),
            data: if data.is_object() { data } else { empty_object() },
        }
    }

    /// Create an event from a typed payload struct.
    pub fn from_payload<T: Serialize>(
        event_type: &str,
        run_id: impl Into<String>,
        payload: &T,
    ) -> Self {
        let data = serde_json::to_value(payload).unwrap_or_else(|_| empty_object());
        Self::new(event_type, run_id, data)
    }

    /// Stamp tenant/user identity into the payload if not already present.
    pub fn with_identity(mut self, identity: &Identity) -> Self {
        if let Value::Object(map) = &mut self.data {
            map.entry("tenant_id".to_string())
                .or_insert_with(|| Value::String(identity.tenant_id.clone()));
            map.entry("user_id".to_string())
                .or_insert_with(|| Value::String(identity.user_id.clone()));
        }
        self
    }

    /// Whether this event terminates its run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            event_types::RUN_COMPLETED | event_types::RUN_FAILED
        )
    }

    /// Fetch a string field from the payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Tenant/user identity attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub tenant_id: String,
    pub user_id: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            user_id: "anonymous".to_string(),
        }
    }
}

// =============================================================================
// Typed payloads
// =============================================================================

/// Data stored with `tool.requested` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequestedPayload {
    pub request_id: String,
    pub tool_name: String,
    pub server_id: String,
    pub permission_scope: String,
    pub arguments: Value,
    pub submitted_at: DateTime<Utc>,
}

/// Data stored with `tool.completed` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCompletedPayload {
    pub request_id: String,
    pub tool_name: String,
    pub output: Value,
    pub duration_ms: u64,
}

/// Data stored with `tool.failed` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailedPayload {
    pub request_id: String,
    pub tool_name: String,
    pub error_kind: String,
    pub error: Value,
    pub duration_ms: u64,
}

/// Data stored with `tool.denied` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeniedPayload {
    pub request_id: String,
    pub tool_name: String,
    pub permission_scope: String,
    pub reason: String,
}

/// Data stored when a tool server raises an application error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerErrorPayload {
    pub request_id: String,
    pub server_id: String,
    pub error: Value,
}

/// Data stored when tools become available for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDiscoveredPayload {
    pub tool_name: String,
    pub server_id: String,
    pub permission_scope: String,
}

/// Data stored with `retrieval.completed` events.
///
/// Carries the full chunk payloads so the run snapshot can be rebuilt from
/// the log alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCompletedPayload {
    pub number_of_chunks: usize,
    pub chunk_ids: Vec<String>,
    pub chunks: Vec<crate::state::RetrievedChunk>,
}

/// Data stored when a guardrail prevents a harmful action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailTriggeredPayload {
    pub layer: String,
    pub threat_type: String,
    pub reason: String,
    pub blocking: bool,
}

/// Data stored when retrieved context is sanitized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSanitizedPayload {
    pub original_chunk_id: String,
    pub sanitization_applied: bool,
}

/// Signal-only prompt injection detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionDetectedPayload {
    pub location: String,
    pub pattern: String,
}

/// Rate limiting metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPayload {
    pub scope: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_roundtrip() {
        let event = Event::new(
            event_types::RUN_STARTED,
            "run-1",
            json!({"message": "hello"}),
        );

        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"type\":\"run.started\""));

        let decoded: Event = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_non_object_data_is_normalized() {
        let event = Event::new(event_types::STATUS_CHANGED, "run-1", json!("oops"));
        assert!(event.data.is_object());
    }

    #[test]
    fn test_identity_stamping_does_not_overwrite() {
        let identity = Identity {
            tenant_id: "acme".to_string(),
            user_id: "u-1".to_string(),
        };
        let event = Event::new(
            event_types::DECISION_MADE,
            "run-1",
            json!({"tenant_id": "other"}),
        )
        .with_identity(&identity);

        assert_eq!(event.data_str("tenant_id"), Some("other"));
        assert_eq!(event.data_str("user_id"), Some("u-1"));
    }

    #[test]
    fn test_terminal_events() {
        assert!(Event::new(event_types::RUN_COMPLETED, "r", json!({})).is_terminal());
        assert!(Event::new(event_types::RUN_FAILED, "r", json!({})).is_terminal());
        assert!(!Event::new(event_types::OUTPUT_CHUNK, "r", json!({})).is_terminal());
    }
}
