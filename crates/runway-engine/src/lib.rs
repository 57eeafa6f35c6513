//! # Runway Engine
//!
//! The durable event-driven workflow engine and its coordination fabric:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RunCoordinator   admission, run.started, startup resume      │
//! └──────────────────────────────────────────────────────────────┘
//!                │
//!                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ WorkflowEngine   per-run driver tasks, retries, waits,       │
//! │                  approval gates, crash-safe resumption       │
//! └──────────────────────────────────────────────────────────────┘
//!                │ activities publish events
//!                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ EventBus   append (seq) → project snapshot → broadcast       │
//! │            JSONL + local fan-out, or Postgres + pg_notify    │
//! └──────────────────────────────────────────────────────────────┘
//!                │ tool.requested
//!                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ ToolExecutor   dedupe → validate → gate → invoke → emit      │
//! │                (durable queue variant for worker processes)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The event log owns historical truth. Run snapshots and workflow records
//! are caches rebuilt from it on demand.

pub mod bus;
pub mod cache;
pub mod collab;
pub mod coordinator;
pub mod engine;
pub mod executor;
pub mod guardrails;
pub mod lease;
pub mod limits;
pub mod model;
pub mod permissions;
pub mod planner;
pub mod projector;
pub mod queue;
pub mod retrieval;
pub mod runtime;
pub mod snapshots;
pub mod store;
pub mod testing;
pub mod tools;

pub use bus::{EventBus, EventTransport, LocalTransport, PublishError};
pub use collab::{
    Guardrail, GuardrailViolation, ModelError, ModelOutput, ModelRequest, ModelStreamer,
    PlanDecision, PlanError, Planner, RetrievalError, Retriever,
};
pub use coordinator::{AdmissionError, RunCoordinator, StartRunRequest};
pub use engine::{
    build_activities, Activity, ActivityContext, ActivityError, EngineError, StepOutcome,
    WorkflowEngine,
};
pub use executor::ToolExecutor;
pub use guardrails::{GuardrailConfig, PatternGuardrail};
pub use lease::{NoopRunLease, RunLease};
pub use limits::{BudgetExceeded, BudgetManager, LimitScope, RateLimiter};
pub use model::TemplateModel;
pub use permissions::{Environment, PermissionGate};
pub use planner::HeuristicPlanner;
pub use projector::{Projector, ProjectorError};
pub use queue::{
    PostgresQueueHandle, QueueDelivery, QueueError, QueueWorkerConfig, ToolQueue,
    ToolQueueConsumer, ToolQueueWorker,
};
pub use retrieval::InMemoryRetriever;
pub use runtime::{Collaborators, Runtime, RuntimeError};
pub use snapshots::{
    JsonStateStore, JsonWorkflowStore, SnapshotError, StateStore, WorkflowStore,
};
pub use store::{EventStore, JsonlEventStore, PostgresStores, StoreError};
pub use tools::{
    CalculatorServer, GithubServer, ToolDescriptor, ToolRegistry, ToolServer, ToolServerError,
};
