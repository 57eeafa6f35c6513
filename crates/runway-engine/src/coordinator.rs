//! Run coordinator: admission, lifecycle, and startup resume

use std::sync::Arc;

use runway_core::event::RateLimitPayload;
use runway_core::{event_types, ChatMode, Event, Identity};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, PublishError};
use crate::engine::{EngineError, WorkflowEngine};
use crate::limits::{BudgetManager, RateLimiter};

/// Inputs for starting a run.
#[derive(Debug, Clone)]
pub struct StartRunRequest {
    /// Caller-supplied run id; generated when absent.
    pub run_id: Option<String>,
    pub message: String,
    pub context: Option<String>,
    pub mode: ChatMode,
    pub identity: Identity,
}

/// Admission and lifecycle failures surfaced to the API.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Empty messages are refused before any event is written.
    #[error("message must not be empty")]
    EmptyMessage,

    /// Concurrency cap hit; `rate.limit.exceeded` was recorded.
    #[error("rate limited at {scope} scope")]
    RateLimited { scope: &'static str },

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Starts runs, enforces caps and budgets, and resumes orphans at startup.
pub struct RunCoordinator {
    bus: Arc<EventBus>,
    engine: Arc<WorkflowEngine>,
    limiter: Arc<RateLimiter>,
    budget: Arc<BudgetManager>,
}

impl RunCoordinator {
    pub fn new(
        bus: Arc<EventBus>,
        engine: Arc<WorkflowEngine>,
        limiter: Arc<RateLimiter>,
        budget: Arc<BudgetManager>,
    ) -> Self {
        Self {
            bus,
            engine,
            limiter,
            budget,
        }
    }

    /// Admit and start a run. On success the `run.started` event is durable
    /// and the engine owns the run.
    pub async fn start_run(&self, request: StartRunRequest) -> Result<String, AdmissionError> {
        if request.message.trim().is_empty() {
            return Err(AdmissionError::EmptyMessage);
        }
        let run_id = request
            .run_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Err(scope) = self
            .limiter
            .try_acquire(&run_id, &request.identity.tenant_id)
        {
            let scope = scope.as_str();
            warn!(%run_id, scope, "run refused by concurrency cap");
            let payload = RateLimitPayload {
                scope: scope.to_string(),
                reason: "concurrency_limit".to_string(),
            };
            self.bus
                .publish(
                    Event::from_payload(event_types::RATE_LIMIT_EXCEEDED, run_id.clone(), &payload)
                        .with_identity(&request.identity),
                )
                .await?;
            return Err(AdmissionError::RateLimited { scope });
        }

        let started = Event::new(
            event_types::RUN_STARTED,
            run_id.clone(),
            json!({
                "message": request.message,
                "context": request.context,
                "mode": request.mode.as_str(),
                "cost_limit": self.budget.limit_usd(),
            }),
        )
        .with_identity(&request.identity);

        if let Err(error) = self.bus.publish(started).await {
            self.limiter.release(&run_id);
            return Err(error.into());
        }
        if let Err(error) = self.engine.start_run(&run_id).await {
            self.limiter.release(&run_id);
            return Err(error.into());
        }
        info!(%run_id, "run admitted");
        Ok(run_id)
    }

    /// Release limiter slots and budget tracking as runs terminate. Spawn
    /// once per process.
    pub fn start_release_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut events = self.bus.subscribe_all();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.is_terminal() {
                    coordinator.limiter.release(&event.run_id);
                    coordinator.budget.reset(&event.run_id);
                }
            }
        })
    }

    /// Re-enqueue every incomplete workflow found at process start.
    pub async fn resume_incomplete(&self) -> Result<usize, EngineError> {
        let resumed = self.engine.resume_incomplete().await?;
        if resumed > 0 {
            info!(count = resumed, "resumed orphaned workflows");
        }
        Ok(resumed)
    }
}
