//! Runtime assembly
//!
//! Builds the full dependency graph for either transport mode from
//! [`Settings`], without starting background work. [`Runtime::start`] then
//! spawns the event pump, the executor, and the housekeeping tasks.

use std::sync::Arc;

use runway_core::{RuntimeMode, Settings};
use tokio::sync::watch;
use tracing::info;

use crate::bus::{EventBus, EventTransport, LocalTransport};
use crate::cache::{RetrievalCache, ToolResultCache};
use crate::collab::{Guardrail, ModelStreamer, Planner, Retriever};
use crate::coordinator::RunCoordinator;
use crate::engine::{build_activities, ActivityContext, WorkflowEngine};
use crate::executor::ToolExecutor;
use crate::guardrails::{GuardrailConfig, PatternGuardrail};
use crate::lease::{NoopRunLease, RunLease};
use crate::limits::{BudgetManager, RateLimiter};
use crate::model::TemplateModel;
use crate::permissions::{Environment, PermissionGate};
use crate::planner::HeuristicPlanner;
use crate::projector::Projector;
use crate::queue::{PostgresQueueHandle, QueueWorkerConfig, ToolQueueWorker};
use crate::retrieval::InMemoryRetriever;
use crate::snapshots::{JsonStateStore, JsonWorkflowStore, SnapshotError, StateStore, WorkflowStore};
use crate::store::{EventStore, JsonlEventStore, PostgresStores, StoreError};
use crate::tools::{CalculatorServer, GithubServer, ToolRegistry};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),

    #[error("distributed mode requires EVENT_STORE_URL")]
    MissingStoreUrl,
}

/// Optional collaborator replacements; defaults are the built-in heuristic
/// implementations.
#[derive(Default)]
pub struct Collaborators {
    pub planner: Option<Arc<dyn Planner>>,
    pub retriever: Option<Arc<dyn Retriever>>,
    pub model: Option<Arc<dyn ModelStreamer>>,
    pub guardrail: Option<Arc<dyn Guardrail>>,
}

/// The assembled runtime for one process.
pub struct Runtime {
    pub settings: Settings,
    pub bus: Arc<EventBus>,
    pub projector: Arc<Projector>,
    pub workflow_store: Arc<dyn WorkflowStore>,
    pub engine: Arc<WorkflowEngine>,
    pub executor: Arc<ToolExecutor>,
    pub coordinator: Arc<RunCoordinator>,
    pub registry: Arc<ToolRegistry>,
    /// Present when the default in-memory retriever is in use; lets the
    /// process seed documents at startup.
    pub retrieval_store: Option<Arc<InMemoryRetriever>>,
    queue: Option<PostgresQueueHandle>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Build the dependency graph for the configured mode.
    pub async fn build(settings: Settings, collaborators: Collaborators) -> Result<Self, RuntimeError> {
        match settings.mode {
            RuntimeMode::SingleProcess => Self::build_local(settings, collaborators).await,
            RuntimeMode::Distributed => Self::build_distributed(settings, collaborators).await,
        }
    }

    async fn build_local(
        settings: Settings,
        collaborators: Collaborators,
    ) -> Result<Self, RuntimeError> {
        if settings.clear_data_on_startup {
            let _ = std::fs::remove_dir_all(&settings.data_dir);
        }
        let event_store: Arc<dyn EventStore> =
            Arc::new(JsonlEventStore::new(settings.data_dir.join("events"))?);
        let state_store: Arc<dyn StateStore> =
            Arc::new(JsonStateStore::new(settings.data_dir.join("state"))?);
        let workflow_store: Arc<dyn WorkflowStore> =
            Arc::new(JsonWorkflowStore::new(settings.data_dir.join("workflow"))?);
        let transport: Arc<dyn EventTransport> = Arc::new(LocalTransport::new());
        let lease: Arc<dyn RunLease> = Arc::new(NoopRunLease);

        Self::assemble(
            settings,
            collaborators,
            event_store,
            state_store,
            workflow_store,
            transport,
            lease,
            None,
        )
    }

    async fn build_distributed(
        settings: Settings,
        collaborators: Collaborators,
    ) -> Result<Self, RuntimeError> {
        let url = settings
            .event_store_url
            .clone()
            .ok_or(RuntimeError::MissingStoreUrl)?;
        let stores = PostgresStores::connect(&url).await?;

        Self::assemble(
            settings,
            collaborators,
            stores.event_store.clone(),
            stores.state_store.clone(),
            stores.workflow_store.clone(),
            stores.transport.clone(),
            stores.lease.clone(),
            Some(PostgresQueueHandle::new(stores.tool_queue.clone())),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        settings: Settings,
        collaborators: Collaborators,
        event_store: Arc<dyn EventStore>,
        state_store: Arc<dyn StateStore>,
        workflow_store: Arc<dyn WorkflowStore>,
        transport: Arc<dyn EventTransport>,
        lease: Arc<dyn RunLease>,
        queue: Option<PostgresQueueHandle>,
    ) -> Result<Self, RuntimeError> {
        let projector = Arc::new(Projector::new(event_store.clone(), state_store));
        let mut bus = EventBus::new(event_store, transport, projector.clone());
        if let Some(queue) = &queue {
            bus = bus.with_tool_queue(queue.producer());
        }
        let bus = Arc::new(bus);

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CalculatorServer::new()));
        registry.register(Arc::new(GithubServer::new(settings.github_token.clone())));
        let registry = Arc::new(registry);

        let permission_gate = Arc::new(PermissionGate::new(Environment::from_settings(&settings)));
        let budget = Arc::new(BudgetManager::new(settings.run_model_budget));
        let limiter = Arc::new(RateLimiter::new(
            settings.global_concurrency,
            settings.tenant_concurrency,
        ));

        let retrieval_cache = settings
            .cache_retrieval
            .then(|| Arc::new(RetrievalCache::new()));
        let tool_cache = settings
            .cache_tool_results
            .then(|| Arc::new(ToolResultCache::new()));

        let (retriever, retrieval_store): (Arc<dyn Retriever>, Option<Arc<InMemoryRetriever>>) =
            match collaborators.retriever {
                Some(retriever) => (retriever, None),
                None => {
                    let store = Arc::new(InMemoryRetriever::new());
                    (store.clone(), Some(store))
                }
            };
        let planner: Arc<dyn Planner> = collaborators
            .planner
            .unwrap_or_else(|| Arc::new(HeuristicPlanner::new()));
        let model: Arc<dyn ModelStreamer> = collaborators
            .model
            .unwrap_or_else(|| Arc::new(TemplateModel::new()));
        let guardrail: Arc<dyn Guardrail> = collaborators.guardrail.unwrap_or_else(|| {
            Arc::new(PatternGuardrail::new(GuardrailConfig::from_settings(&settings)))
        });

        let context = Arc::new(ActivityContext::new(
            bus.clone(),
            planner,
            retriever,
            model,
            guardrail,
            registry.clone(),
            budget.clone(),
            retrieval_cache,
            settings.retries.clone(),
        ));
        let activities = build_activities(context);

        let engine = Arc::new(WorkflowEngine::new(
            bus.clone(),
            workflow_store.clone(),
            activities,
            settings.retries.clone(),
            settings.global_concurrency,
            lease,
        ));
        let executor = Arc::new(ToolExecutor::new(
            bus.clone(),
            registry.clone(),
            permission_gate,
            tool_cache,
        ));
        let coordinator = Arc::new(RunCoordinator::new(
            bus.clone(),
            engine.clone(),
            limiter,
            budget,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            settings,
            bus,
            projector,
            workflow_store,
            engine,
            executor,
            coordinator,
            registry,
            retrieval_store,
            queue,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Spawn the background services: engine event pump, tool execution,
    /// and limiter housekeeping.
    pub fn start(&self) {
        self.engine.start_event_pump();
        self.coordinator.start_release_watcher();

        match &self.queue {
            None => {
                // Single process: the executor feeds off the in-memory bus.
                // Subscribe before spawning so no request slips through.
                let events = self.bus.subscribe_all();
                let executor = self.executor.clone();
                let shutdown = self.shutdown_rx.clone();
                tokio::spawn(async move {
                    executor.run(events, shutdown).await;
                });
            }
            Some(queue) => {
                // Distributed: tool requests arrive through the durable
                // queue with at-least-once delivery.
                let worker = ToolQueueWorker::new(
                    queue.consumer(),
                    self.executor.clone(),
                    QueueWorkerConfig::default(),
                );
                let shutdown = self.shutdown_rx.clone();
                tokio::spawn(async move {
                    worker.run(shutdown).await;
                });
            }
        }
        info!(mode = self.settings.mode.as_str(), "runtime started");
    }

    /// Resume orphaned workflows; call after [`Self::start`].
    pub async fn resume_incomplete(&self) -> Result<usize, RuntimeError> {
        Ok(self.coordinator.resume_incomplete().await?)
    }

    /// Signal all background tasks to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
