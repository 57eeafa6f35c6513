//! Durable workflow state for the fixed step pipeline

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named position in the fixed pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Receive,
    Plan,
    Retrieve,
    Respond,
    Verify,
    MaybeApprove,
    Finalize,
}

impl Step {
    /// All steps in execution order.
    pub const ALL: [Step; 7] = [
        Step::Receive,
        Step::Plan,
        Step::Retrieve,
        Step::Respond,
        Step::Verify,
        Step::MaybeApprove,
        Step::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::Plan => "plan",
            Self::Retrieve => "retrieve",
            Self::Respond => "respond",
            Self::Verify => "verify",
            Self::MaybeApprove => "maybe_approve",
            Self::Finalize => "finalize",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == value)
    }

    /// The step that follows this one, or `None` after the last.
    pub fn next(&self) -> Option<Step> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level status values persisted with every workflow transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    WaitingForEvent,
    WaitingForApproval,
    Retrying,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingForEvent => "waiting_for_event",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Durable workflow record persisted after every transition.
///
/// Invariants: while `status` is a waiting state `current_step` is set and no
/// activity is executing; `attempts[step]` never exceeds the step's
/// configured maximum unless the workflow is failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<Step>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub attempts: BTreeMap<Step, u32>,
    #[serde(default)]
    pub pending_event_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Value>,
    /// Deadline for the next attempt while `status == Retrying`. A deadline
    /// that passes while the process is down resumes immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            current_step: Some(Step::Receive),
            status: WorkflowStatus::Running,
            attempts: BTreeMap::new(),
            pending_event_types: Vec::new(),
            waiting_reason: None,
            human_decision: None,
            last_error: None,
            retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Increment and return the attempt count for the current step.
    pub fn record_attempt(&mut self, step: Step) -> u32 {
        let count = self.attempts.entry(step).or_insert(0);
        *count += 1;
        let attempt = *count;
        self.status = WorkflowStatus::Running;
        self.retry_at = None;
        self.touch();
        attempt
    }

    pub fn attempts_for(&self, step: Step) -> u32 {
        self.attempts.get(&step).copied().unwrap_or(0)
    }

    /// Move to the provided step and clear transient flags.
    pub fn advance_to(&mut self, step: Step) {
        self.current_step = Some(step);
        self.status = WorkflowStatus::Running;
        self.pending_event_types.clear();
        self.waiting_reason = None;
        self.last_error = None;
        self.retry_at = None;
        self.touch();
    }

    pub fn mark_retrying(&mut self, error: Value, retry_at: DateTime<Utc>) {
        self.status = WorkflowStatus::Retrying;
        self.last_error = Some(error);
        self.pending_event_types.clear();
        self.retry_at = Some(retry_at);
        self.touch();
    }

    pub fn mark_waiting_for_events(&mut self, event_types: Vec<String>, reason: String) {
        self.status = WorkflowStatus::WaitingForEvent;
        self.pending_event_types = event_types;
        self.waiting_reason = Some(reason);
        self.touch();
    }

    pub fn mark_waiting_for_approval(&mut self, reason: String) {
        self.status = WorkflowStatus::WaitingForApproval;
        self.pending_event_types.clear();
        self.waiting_reason = Some(reason);
        self.touch();
    }

    pub fn set_human_decision(&mut self, decision: String) {
        self.human_decision = Some(decision);
        self.status = WorkflowStatus::Running;
        self.waiting_reason = None;
        self.pending_event_types.clear();
        self.touch();
    }

    /// Clear the awaited event set once one of them has arrived.
    pub fn clear_pending_events(&mut self) {
        self.pending_event_types.clear();
        self.status = WorkflowStatus::Running;
        self.waiting_reason = None;
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.status = WorkflowStatus::Completed;
        self.pending_event_types.clear();
        self.waiting_reason = None;
        self.retry_at = None;
        self.touch();
    }

    pub fn mark_failed(&mut self, error: Value) {
        self.status = WorkflowStatus::Failed;
        self.last_error = Some(error);
        self.pending_event_types.clear();
        self.waiting_reason = None;
        self.retry_at = None;
        self.touch();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the provided event type satisfies the current wait.
    pub fn awaits(&self, event_type: &str) -> bool {
        self.status == WorkflowStatus::WaitingForEvent
            && self.pending_event_types.iter().any(|t| t == event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_order() {
        assert_eq!(Step::Receive.next(), Some(Step::Plan));
        assert_eq!(Step::Verify.next(), Some(Step::MaybeApprove));
        assert_eq!(Step::Finalize.next(), None);
    }

    #[test]
    fn test_step_parse_roundtrip() {
        for step in Step::ALL {
            assert_eq!(Step::parse(step.as_str()), Some(step));
        }
        assert_eq!(Step::parse("bogus"), None);
    }

    #[test]
    fn test_attempt_counting() {
        let mut state = WorkflowState::new("run-1");
        assert_eq!(state.record_attempt(Step::Respond), 1);
        assert_eq!(state.record_attempt(Step::Respond), 2);
        assert_eq!(state.attempts_for(Step::Respond), 2);
        assert_eq!(state.attempts_for(Step::Plan), 0);
    }

    #[test]
    fn test_advance_clears_transient_flags() {
        let mut state = WorkflowState::new("run-1");
        state.mark_waiting_for_events(
            vec!["tool.completed".to_string()],
            "waiting_for_tool".to_string(),
        );
        assert!(state.awaits("tool.completed"));
        assert!(!state.awaits("tool.discovered"));

        state.advance_to(Step::Respond);
        assert_eq!(state.status, WorkflowStatus::Running);
        assert!(state.pending_event_types.is_empty());
        assert!(state.waiting_reason.is_none());
    }

    #[test]
    fn test_terminal_states() {
        let mut state = WorkflowState::new("run-1");
        assert!(!state.is_terminal());
        state.mark_failed(json!({"error": "boom"}));
        assert!(state.is_terminal());
        assert!(state.last_error.is_some());
    }

    #[test]
    fn test_workflow_state_serde_roundtrip() {
        let mut state = WorkflowState::new("run-1");
        state.record_attempt(Step::Receive);
        state.mark_waiting_for_approval("verification_failed".to_string());

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: WorkflowState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(state, decoded);
    }
}
