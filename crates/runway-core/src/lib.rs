//! # Runway Core
//!
//! Shared types for the Runway run engine:
//!
//! - [`event`]: the immutable event envelope and the closed type vocabulary
//! - [`projection`]: the fold from an event log into a [`state::RunState`]
//! - [`state`]: the materialized run snapshot
//! - [`workflow`]: the durable workflow record and the fixed step pipeline
//! - [`retry`]: per-step retry policy
//! - [`error`]: the closed error taxonomy
//! - [`config`]: environment-driven settings
//!
//! The event log owns historical truth; everything else in this crate is a
//! derived view or a policy over it.

pub mod config;
pub mod error;
pub mod event;
pub mod projection;
pub mod retry;
pub mod state;
pub mod workflow;

pub use config::{RuntimeMode, Settings};
pub use error::ErrorKind;
pub use event::{event_types, Event, Identity};
pub use projection::{apply_event, project};
pub use retry::{RetryPolicy, RetrySchedule};
pub use state::{
    ChatMode, DecisionRecord, GuardrailRecord, Outcome, PlanType, RetrievedChunk, RunPhase,
    RunState, ToolRequestRecord, ToolResultRecord, ToolStatus,
};
pub use workflow::{Step, WorkflowState, WorkflowStatus};
