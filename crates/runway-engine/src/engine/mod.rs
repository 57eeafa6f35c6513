//! Durable workflow engine
//!
//! Drives each run through the fixed step pipeline: parallel across runs,
//! strictly serial per run. Every run is owned by a single driver task; all
//! workflow-record writes for a live run happen on that task. Suspension is
//! a data transition (`waiting_*` persisted, task parked on its signal
//! queue), never a thread parked on a condition variable, so a process
//! restart can resume from the store alone.

mod activities;
mod context;

pub use activities::build_activities;
pub use context::ActivityContext;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use runway_core::{
    event_types, ErrorKind, Event, RetrySchedule, RunState, Step, WorkflowState, WorkflowStatus,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use crate::bus::{EventBus, PublishError};
use crate::lease::RunLease;
use crate::snapshots::{SnapshotError, WorkflowStore};
use crate::store::StoreError;

/// How an activity left its step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Proceed to the next step in the fixed order.
    Advance,
    /// Suspend until any one of the named event types arrives for this run.
    WaitForEvents {
        event_types: Vec<String>,
        reason: String,
    },
    /// Suspend until a human decision is recorded.
    WaitForApproval { reason: String },
}

/// Classified activity failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActivityError {
    /// Retried per the step's policy; fatal once attempts are exhausted.
    #[error("{kind}: {message}")]
    Transient { kind: ErrorKind, message: String },

    /// Terminates the run.
    #[error("{kind}: {message}")]
    Fatal { kind: ErrorKind, message: String },
}

impl ActivityError {
    pub fn transient(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Fatal {
            kind,
            message: message.into(),
        }
    }
}

/// The unit of work attached to a workflow step.
///
/// Activities publish events through the [`ActivityContext`]; the local
/// `state` copy evolves through the same fold the projector uses, so an
/// activity re-run after a crash recomputes from events already in the log.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    async fn execute(
        &self,
        state: &mut RunState,
        workflow: &mut WorkflowState,
    ) -> Result<StepOutcome, ActivityError>;
}

/// Errors from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run already terminated: {0}")]
    RunTerminated(String),
}

/// Hard wall-clock bound on a single activity invocation; exceeding it is a
/// transient failure handled by the step's retry policy.
const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// How often a live driver renews its run lease. Must stay well under the
/// lease TTL or a second process can claim a run that is still being driven.
const LEASE_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

enum Signal {
    Resume,
    Event(Event),
    Cancel { reason: String },
}

type SignalSender = mpsc::UnboundedSender<Signal>;

/// Step-wise scheduler with retries, waits, approval gates, and crash-safe
/// resumption.
pub struct WorkflowEngine {
    bus: Arc<EventBus>,
    workflow_store: Arc<dyn WorkflowStore>,
    activities: HashMap<Step, Arc<dyn Activity>>,
    retries: RetrySchedule,
    worker_slots: Arc<Semaphore>,
    lease: Arc<dyn RunLease>,
    activity_timeout: Duration,
    runtimes: Mutex<HashMap<String, SignalSender>>,
}

impl WorkflowEngine {
    pub fn new(
        bus: Arc<EventBus>,
        workflow_store: Arc<dyn WorkflowStore>,
        activities: HashMap<Step, Arc<dyn Activity>>,
        retries: RetrySchedule,
        worker_count: usize,
        lease: Arc<dyn RunLease>,
    ) -> Self {
        Self {
            bus,
            workflow_store,
            activities,
            retries,
            worker_slots: Arc::new(Semaphore::new(worker_count.max(1))),
            lease,
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = timeout;
        self
    }

    fn lease_key(run_id: &str) -> String {
        format!("workflow:{run_id}")
    }

    /// Start (or restart) driving a run. Emits `workflow.started` for new
    /// workflows.
    pub async fn start_run(self: &Arc<Self>, run_id: &str) -> Result<(), EngineError> {
        if !self.lease.acquire(&Self::lease_key(run_id)).await {
            info!(%run_id, "workflow lease unavailable; skipping start");
            return Ok(());
        }
        let workflow = match self.workflow_store.load(run_id).await? {
            Some(existing) => existing,
            None => {
                let fresh = WorkflowState::new(run_id);
                self.workflow_store.save(&fresh).await?;
                self.emit(
                    run_id,
                    event_types::WORKFLOW_STARTED,
                    json!({
                        "current_step": fresh.current_step.map(|s| s.as_str()),
                        "status": fresh.status.as_str(),
                    }),
                )
                .await?;
                fresh
            }
        };
        if workflow.is_terminal() {
            self.lease.release(&Self::lease_key(run_id)).await;
            return Ok(());
        }
        self.spawn_driver(run_id);
        self.signal(run_id, Signal::Resume);
        Ok(())
    }

    /// Rehydrate a run from persisted state, e.g. after process restart.
    pub async fn resume_run(self: &Arc<Self>, run_id: &str) -> Result<(), EngineError> {
        if self.runtimes.lock().contains_key(run_id) {
            self.signal(run_id, Signal::Resume);
            return Ok(());
        }
        let Some(workflow) = self.workflow_store.load(run_id).await? else {
            return Err(EngineError::RunNotFound(run_id.to_string()));
        };
        if workflow.is_terminal() {
            return Ok(());
        }
        if !self.lease.acquire(&Self::lease_key(run_id)).await {
            info!(%run_id, "workflow lease unavailable; skipping resume");
            return Ok(());
        }
        info!(%run_id, step = ?workflow.current_step, status = workflow.status.as_str(), "resuming workflow");
        self.spawn_driver(run_id);
        self.signal(run_id, Signal::Resume);
        Ok(())
    }

    /// Record a human approval decision and resume the waiting run.
    ///
    /// Returns `RunTerminated` when the run already finished; the decision
    /// is then discarded.
    pub async fn record_approval(
        self: &Arc<Self>,
        run_id: &str,
        decision: &str,
    ) -> Result<(), EngineError> {
        let Some(workflow) = self.workflow_store.load(run_id).await? else {
            return Err(EngineError::RunNotFound(run_id.to_string()));
        };
        if workflow.is_terminal() {
            return Err(EngineError::RunTerminated(run_id.to_string()));
        }
        self.emit(
            run_id,
            event_types::WORKFLOW_APPROVAL_RECORDED,
            json!({"decision": decision}),
        )
        .await?;
        // Delivery to the driver happens through the event pump.
        Ok(())
    }

    /// Cancel a run. The driver observes the request at the next suspension
    /// point; already-emitted output is kept.
    pub async fn cancel_run(self: &Arc<Self>, run_id: &str, reason: &str) -> Result<(), EngineError> {
        let Some(workflow) = self.workflow_store.load(run_id).await? else {
            return Err(EngineError::RunNotFound(run_id.to_string()));
        };
        if workflow.is_terminal() {
            return Err(EngineError::RunTerminated(run_id.to_string()));
        }
        if self.runtimes.lock().contains_key(run_id) {
            self.signal(
                run_id,
                Signal::Cancel {
                    reason: reason.to_string(),
                },
            );
            return Ok(());
        }
        // No live driver; terminate directly.
        let mut workflow = workflow;
        self.terminate_cancelled(&mut workflow, reason).await
    }

    /// Route persisted events to waiting runs. Spawn once per process.
    pub fn start_event_pump(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut events = self.bus.subscribe_all();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.route_event(event).await;
            }
        })
    }

    /// Resume every non-terminal workflow found in the store.
    pub async fn resume_incomplete(self: &Arc<Self>) -> Result<usize, EngineError> {
        let incomplete = self.workflow_store.list_incomplete().await?;
        let count = incomplete.len();
        for workflow in incomplete {
            if let Err(err) = self.resume_run(&workflow.run_id).await {
                warn!(run_id = %workflow.run_id, %err, "failed to resume workflow");
            }
        }
        Ok(count)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn route_event(self: &Arc<Self>, event: Event) {
        let relevant = event.event_type == event_types::WORKFLOW_APPROVAL_RECORDED
            || event_types::TOOL_TERMINATORS.contains(&event.event_type.as_str());
        if !relevant {
            return;
        }
        let run_id = event.run_id.clone();
        let has_runtime = self.runtimes.lock().contains_key(&run_id);
        if !has_runtime {
            // A waiting run with no driver (crash, lease handover) must be
            // rehydrated before delivery.
            match self.workflow_store.load(&run_id).await {
                Ok(Some(workflow)) if !workflow.is_terminal() => {
                    if let Err(err) = self.resume_run(&run_id).await {
                        warn!(%run_id, %err, "failed to rehydrate workflow for event");
                        return;
                    }
                }
                _ => return,
            }
        }
        self.signal(&run_id, Signal::Event(event));
    }

    fn spawn_driver(self: &Arc<Self>, run_id: &str) {
        let mut runtimes = self.runtimes.lock();
        if runtimes.contains_key(run_id) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        runtimes.insert(run_id.to_string(), tx);
        drop(runtimes);

        let engine = Arc::clone(self);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            engine.drive(&run_id, rx).await;
            engine.runtimes.lock().remove(&run_id);
            engine.bus.projector().evict(&run_id);
            engine.lease.release(&Self::lease_key(&run_id)).await;
        });
    }

    fn signal(&self, run_id: &str, signal: Signal) {
        if let Some(sender) = self.runtimes.lock().get(run_id) {
            let _ = sender.send(signal);
        }
    }

    async fn drive(self: &Arc<Self>, run_id: &str, mut rx: mpsc::UnboundedReceiver<Signal>) {
        // Events that arrived while a step was executing; consulted before
        // parking on the queue so a fast tool completion is never lost.
        let mut buffered: VecDeque<Event> = VecDeque::new();

        loop {
            // Cancellation is observed at step boundaries only.
            while let Ok(signal) = rx.try_recv() {
                match signal {
                    Signal::Cancel { reason } => {
                        self.handle_cancel(run_id, &reason).await;
                        return;
                    }
                    Signal::Event(event) => self.stash_event(run_id, &mut buffered, event).await,
                    Signal::Resume => {}
                }
            }

            if !self.lease.refresh(&Self::lease_key(run_id)).await {
                warn!(%run_id, "workflow lease lost; stopping driver");
                return;
            }

            let mut workflow = match self.workflow_store.load(run_id).await {
                Ok(Some(workflow)) => workflow,
                Ok(None) => {
                    warn!(%run_id, "workflow record missing; stopping driver");
                    return;
                }
                Err(err) => {
                    error!(%run_id, %err, "workflow store unavailable; stopping driver");
                    return;
                }
            };
            if workflow.is_terminal() {
                return;
            }

            match workflow.status {
                WorkflowStatus::WaitingForEvent => {
                    if let Some(position) = buffered
                        .iter()
                        .position(|e| workflow.awaits(&e.event_type))
                    {
                        buffered.drain(..=position);
                        workflow.clear_pending_events();
                        if self.save(&workflow).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    match self.wait_signal(run_id, &mut rx).await {
                        Some(Signal::Cancel { reason }) => {
                            self.handle_cancel(run_id, &reason).await;
                            return;
                        }
                        Some(Signal::Event(event)) => {
                            self.stash_event(run_id, &mut buffered, event).await;
                            continue;
                        }
                        Some(Signal::Resume) => continue,
                        None => return,
                    }
                }
                WorkflowStatus::WaitingForApproval => {
                    if workflow.human_decision.is_some() {
                        // Applied by the approval handler; keep going.
                        continue;
                    }
                    match self.wait_signal(run_id, &mut rx).await {
                        Some(Signal::Cancel { reason }) => {
                            self.handle_cancel(run_id, &reason).await;
                            return;
                        }
                        Some(Signal::Event(event)) => {
                            self.stash_event(run_id, &mut buffered, event).await;
                            continue;
                        }
                        Some(Signal::Resume) => continue,
                        None => return,
                    }
                }
                WorkflowStatus::Retrying => {
                    if let Some(retry_at) = workflow.retry_at {
                        let now = Utc::now();
                        if retry_at > now {
                            if let Ok(delay) = (retry_at - now).to_std() {
                                if !self.sleep_holding_lease(run_id, delay).await {
                                    warn!(%run_id, "workflow lease lost during backoff; stopping driver");
                                    return;
                                }
                            }
                        }
                    }
                    // Deadline passed (possibly while the process was down):
                    // run the step immediately.
                    if self.execute_step(run_id, &mut workflow).await.is_break() {
                        return;
                    }
                }
                WorkflowStatus::Running => {
                    if self.execute_step(run_id, &mut workflow).await.is_break() {
                        return;
                    }
                }
                WorkflowStatus::Completed | WorkflowStatus::Failed => return,
            }
        }
    }

    fn lease_refresh_ticker() -> tokio::time::Interval {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + LEASE_REFRESH_INTERVAL,
            LEASE_REFRESH_INTERVAL,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    }

    /// Park on the signal queue, renewing the run lease while parked.
    /// Returns `None` when the channel closes or the lease is lost.
    async fn wait_signal(
        &self,
        run_id: &str,
        rx: &mut mpsc::UnboundedReceiver<Signal>,
    ) -> Option<Signal> {
        let mut refresh = Self::lease_refresh_ticker();
        loop {
            tokio::select! {
                signal = rx.recv() => return signal,
                _ = refresh.tick() => {
                    if !self.lease.refresh(&Self::lease_key(run_id)).await {
                        warn!(%run_id, "workflow lease lost while waiting; stopping driver");
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep through a retry backoff, renewing the run lease along the way.
    /// Returns false when the lease is lost.
    async fn sleep_holding_lease(&self, run_id: &str, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        let mut refresh = Self::lease_refresh_ticker();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                _ = refresh.tick() => {
                    if !self.lease.refresh(&Self::lease_key(run_id)).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Apply approval decisions as they are routed in; everything else is
    /// buffered for wait satisfaction.
    async fn stash_event(&self, run_id: &str, buffered: &mut VecDeque<Event>, event: Event) {
        if event.event_type == event_types::WORKFLOW_APPROVAL_RECORDED {
            if let Some(decision) = event.data_str("decision") {
                if let Ok(Some(mut workflow)) = self.workflow_store.load(run_id).await {
                    if !workflow.is_terminal() {
                        workflow.set_human_decision(decision.to_string());
                        let _ = self.save(&workflow).await;
                    }
                }
            }
            return;
        }
        buffered.push_back(event);
    }

    /// Run one step of the workflow. Returns `Break` when the driver should
    /// stop (terminal state or infrastructure failure).
    async fn execute_step(
        self: &Arc<Self>,
        run_id: &str,
        workflow: &mut WorkflowState,
    ) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow::{Break, Continue};

        let Some(step) = workflow.current_step else {
            workflow.mark_completed();
            if self.save(workflow).await.is_err() {
                return Break(());
            }
            let _ = self.finish(run_id, workflow).await;
            return Break(());
        };
        let Some(activity) = self.activities.get(&step).cloned() else {
            workflow.mark_failed(json!({"error": "missing_activity", "step": step.as_str()}));
            let _ = self.save(workflow).await;
            let _ = self.finish(run_id, workflow).await;
            return Break(());
        };

        let attempt = workflow.record_attempt(step);
        if self.save(workflow).await.is_err() {
            return Break(());
        }
        info!(%run_id, %step, attempt, "workflow step started");
        if self
            .emit(
                run_id,
                event_types::WORKFLOW_STEP_STARTED,
                json!({"step": step.as_str(), "attempt": attempt}),
            )
            .await
            .is_err()
        {
            return Break(());
        }

        let mut state = match self.bus.projector().load(run_id).await {
            Ok(Some(state)) => state,
            Ok(None) => RunState::empty(run_id),
            Err(err) => {
                error!(%run_id, %err, "projection unavailable; stopping driver");
                return Break(());
            }
        };

        // Activity bodies treat node boundaries as given: the engine brackets
        // every invocation with node.started / node.completed.
        if self
            .emit_folded(run_id, &mut state, event_types::NODE_STARTED, json!({"name": step.as_str()}))
            .await
            .is_err()
        {
            return Break(());
        }

        let permit = match Arc::clone(&self.worker_slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Break(()),
        };
        let result = {
            let activity_run = tokio::time::timeout(
                self.activity_timeout,
                activity.execute(&mut state, workflow),
            );
            tokio::pin!(activity_run);
            let mut refresh = Self::lease_refresh_ticker();
            loop {
                tokio::select! {
                    outcome = &mut activity_run => {
                        break match outcome {
                            Ok(result) => result,
                            Err(_) => Err(ActivityError::transient(
                                ErrorKind::Timeout,
                                format!(
                                    "step {step} exceeded {}s wall clock",
                                    self.activity_timeout.as_secs()
                                ),
                            )),
                        };
                    }
                    _ = refresh.tick() => {
                        // The in-flight step finishes either way; a lost
                        // lease stops the driver at the next boundary check.
                        if !self.lease.refresh(&Self::lease_key(run_id)).await {
                            warn!(%run_id, %step, "workflow lease lost during step execution");
                        }
                    }
                }
            }
        };
        drop(permit);

        if self
            .emit_folded(run_id, &mut state, event_types::NODE_COMPLETED, json!({"name": step.as_str()}))
            .await
            .is_err()
        {
            return Break(());
        }

        match result {
            Ok(StepOutcome::Advance) => {
                if self
                    .emit(
                        run_id,
                        event_types::WORKFLOW_STEP_COMPLETED,
                        json!({"step": step.as_str(), "attempt": attempt}),
                    )
                    .await
                    .is_err()
                {
                    return Break(());
                }
                if workflow.is_terminal() {
                    // The activity (finalize) chose the terminal status.
                    if self.save(workflow).await.is_err() {
                        return Break(());
                    }
                    let _ = self.finish(run_id, workflow).await;
                    return Break(());
                }
                match step.next() {
                    Some(next) => {
                        workflow.advance_to(next);
                        if self.save(workflow).await.is_err() {
                            return Break(());
                        }
                        Continue(())
                    }
                    None => {
                        workflow.mark_completed();
                        if self.save(workflow).await.is_err() {
                            return Break(());
                        }
                        let _ = self.finish(run_id, workflow).await;
                        Break(())
                    }
                }
            }
            Ok(StepOutcome::WaitForEvents { event_types: types, reason }) => {
                workflow.mark_waiting_for_events(types.clone(), reason.clone());
                if self.save(workflow).await.is_err() {
                    return Break(());
                }
                info!(%run_id, %step, events = types.join(","), "workflow waiting for events");
                let _ = self
                    .emit(
                        run_id,
                        event_types::WORKFLOW_WAITING_FOR_EVENT,
                        json!({"step": step.as_str(), "event_types": types, "reason": reason}),
                    )
                    .await;
                Continue(())
            }
            Ok(StepOutcome::WaitForApproval { reason }) => {
                workflow.mark_waiting_for_approval(reason.clone());
                if self.save(workflow).await.is_err() {
                    return Break(());
                }
                info!(%run_id, %step, %reason, "workflow waiting for approval");
                let _ = self
                    .emit(
                        run_id,
                        event_types::WORKFLOW_WAITING_FOR_APPROVAL,
                        json!({"step": step.as_str(), "reason": reason}),
                    )
                    .await;
                Continue(())
            }
            Err(ActivityError::Transient { kind, message }) => {
                let policy = self.retries.policy_for(step);
                if policy.allows(attempt) {
                    let backoff = policy.delay_after_attempt(attempt);
                    let retry_at = Utc::now()
                        + chrono::Duration::from_std(backoff)
                            .unwrap_or_else(|_| chrono::Duration::seconds(0));
                    workflow.mark_retrying(
                        json!({
                            "step": step.as_str(),
                            "attempt": attempt,
                            "error_type": kind.as_str(),
                            "message": message,
                        }),
                        retry_at,
                    );
                    if self.save(workflow).await.is_err() {
                        return Break(());
                    }
                    warn!(%run_id, %step, attempt, ?backoff, "workflow step retrying");
                    let _ = self
                        .emit(
                            run_id,
                            event_types::WORKFLOW_RETRYING,
                            json!({
                                "step": step.as_str(),
                                "attempt": attempt,
                                "backoff_seconds": backoff.as_secs_f64(),
                            }),
                        )
                        .await;
                    Continue(())
                } else {
                    self.fail_step(run_id, workflow, step, attempt, kind, &message)
                        .await;
                    Break(())
                }
            }
            Err(ActivityError::Fatal { kind, message }) => {
                self.fail_step(run_id, workflow, step, attempt, kind, &message)
                    .await;
                Break(())
            }
        }
    }

    /// Terminal failure: workflow.step.completed with the error, then
    /// workflow.failed, then the run-terminal event last.
    async fn fail_step(
        &self,
        run_id: &str,
        workflow: &mut WorkflowState,
        step: Step,
        attempt: u32,
        kind: ErrorKind,
        message: &str,
    ) {
        let error_payload = json!({
            "step": step.as_str(),
            "attempt": attempt,
            "error_type": kind.as_str(),
            "message": message,
        });
        error!(%run_id, %step, attempt, error_type = kind.as_str(), "workflow step failed; terminating run");
        workflow.mark_failed(error_payload.clone());
        let _ = self.save(workflow).await;
        let _ = self
            .emit(
                run_id,
                event_types::WORKFLOW_STEP_COMPLETED,
                json!({"step": step.as_str(), "attempt": attempt, "error_type": kind.as_str()}),
            )
            .await;
        let _ = self
            .emit(run_id, event_types::WORKFLOW_FAILED, error_payload)
            .await;
        let _ = self
            .emit_terminal(run_id, false, Some(message.to_string()))
            .await;
    }

    async fn handle_cancel(&self, run_id: &str, reason: &str) {
        let Ok(Some(mut workflow)) = self.workflow_store.load(run_id).await else {
            return;
        };
        if workflow.is_terminal() {
            return;
        }
        self.terminate_cancelled(&mut workflow, reason)
            .await
            .unwrap_or_else(|err| error!(%run_id, %err, "failed to record cancellation"));
    }

    async fn terminate_cancelled(
        &self,
        workflow: &mut WorkflowState,
        reason: &str,
    ) -> Result<(), EngineError> {
        let run_id = workflow.run_id.clone();
        info!(%run_id, %reason, "cancelling run");
        workflow.mark_failed(json!({"error": "cancelled", "reason": reason}));
        self.save(workflow).await?;
        self.emit(
            &run_id,
            event_types::WORKFLOW_FAILED,
            json!({"error_type": "cancelled", "reason": reason}),
        )
        .await?;
        self.emit_terminal(&run_id, false, Some("cancelled".to_string()))
            .await?;
        Ok(())
    }

    /// Emit workflow.completed/failed and then exactly one run-terminal
    /// event, chosen from the workflow status.
    async fn finish(&self, run_id: &str, workflow: &WorkflowState) -> Result<(), EngineError> {
        let completed = workflow.status == WorkflowStatus::Completed;
        self.emit(
            run_id,
            if completed {
                event_types::WORKFLOW_COMPLETED
            } else {
                event_types::WORKFLOW_FAILED
            },
            workflow.last_error.clone().unwrap_or_else(|| json!({})),
        )
        .await?;
        let reason = match &workflow.last_error {
            Some(Value::Object(map)) => map
                .get("message")
                .or_else(|| map.get("reason"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        self.emit_terminal(run_id, completed, reason).await?;
        info!(%run_id, completed, "workflow finished");
        Ok(())
    }

    /// Append the single run-terminal event, unless one already exists (an
    /// earlier emitter won; converge without a duplicate).
    async fn emit_terminal(
        &self,
        run_id: &str,
        completed: bool,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let history = self.bus.store().history(run_id).await?;
        if history.iter().any(|e| e.is_terminal()) {
            return Ok(());
        }
        let state = self.bus.projector().load(run_id).await.ok().flatten();
        let final_text = state.as_ref().map(|s| s.output_text.clone()).unwrap_or_default();
        let reason = reason.or_else(|| {
            state
                .as_ref()
                .and_then(|s| s.verification_reason.clone())
        });

        let mut payload = json!({"final_text": final_text});
        if let (Value::Object(map), Some(reason)) = (&mut payload, reason) {
            map.insert("reason".to_string(), Value::String(reason));
        }
        let event_type = if completed {
            event_types::RUN_COMPLETED
        } else {
            event_types::RUN_FAILED
        };
        self.bus
            .publish(Event::new(event_type, run_id, payload))
            .await?;
        Ok(())
    }

    async fn emit(&self, run_id: &str, event_type: &str, data: Value) -> Result<Event, EngineError> {
        Ok(self
            .bus
            .publish(Event::new(event_type, run_id, data))
            .await?)
    }

    /// Emit and fold into the driver's working snapshot so activities see
    /// their own writes.
    async fn emit_folded(
        &self,
        run_id: &str,
        state: &mut RunState,
        event_type: &str,
        data: Value,
    ) -> Result<(), EngineError> {
        let stored = self.emit(run_id, event_type, data).await?;
        runway_core::apply_event(state, &stored);
        Ok(())
    }

    async fn save(&self, workflow: &WorkflowState) -> Result<(), EngineError> {
        self.workflow_store.save(workflow).await.map_err(|err| {
            error!(run_id = %workflow.run_id, %err, "workflow store write failed");
            EngineError::Snapshot(err)
        })
    }
}
