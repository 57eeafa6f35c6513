//! Tool executor: consumes `tool.requested`, emits exactly one terminator
//!
//! For every request id exactly one of `tool.completed`, `tool.failed`, or
//! `tool.denied` is emitted, possibly preceded by one `tool.server.error`.
//! The workflow engine relies on this to resume the waiting step.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use runway_core::event::{
    ToolCompletedPayload, ToolDeniedPayload, ToolFailedPayload, ToolServerErrorPayload,
};
use runway_core::{event_types, Event};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};

use crate::bus::EventBus;
use crate::cache::ToolResultCache;
use crate::permissions::PermissionGate;
use crate::tools::{ToolRegistry, ToolServerError};

const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Executes registered tools in response to `tool.requested` events.
pub struct ToolExecutor {
    bus: Arc<EventBus>,
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    cache: Option<Arc<ToolResultCache>>,
    invoke_timeout: Duration,
    seen: Mutex<HashSet<String>>,
}

impl ToolExecutor {
    pub fn new(
        bus: Arc<EventBus>,
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        cache: Option<Arc<ToolResultCache>>,
    ) -> Self {
        Self {
            bus,
            registry,
            gate,
            cache,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Consume an in-process event stream until shutdown (single-process
    /// wiring). The subscription is created by the caller before spawning so
    /// no `tool.requested` published in between is missed. The distributed
    /// wiring drives [`Self::execute_request`] from the durable queue
    /// instead.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("tool executor started");
        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) if event.event_type == event_types::TOOL_REQUESTED => {
                            self.execute_request(&event).await;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("tool executor stopped");
    }

    /// Process one `tool.requested` event end to end.
    #[instrument(skip(self, event), fields(run_id = %event.run_id))]
    pub async fn execute_request(&self, event: &Event) {
        let run_id = event.run_id.clone();
        let request_id = event.data_str("request_id").unwrap_or_default().to_string();
        let tool_name = event.data_str("tool_name").unwrap_or_default().to_string();
        let arguments = event.data.get("arguments").cloned().unwrap_or(Value::Null);

        // At-most-once per request id within this process; the durable
        // queue's consumer state covers redelivery across processes.
        if !self.seen.lock().insert(request_id.clone()) {
            return;
        }

        let Some(descriptor) = self.registry.descriptor(&tool_name).cloned() else {
            self.emit_failed(
                &run_id,
                &request_id,
                &tool_name,
                "schema_violation",
                json!({"error": "unknown_tool"}),
                0,
            )
            .await;
            return;
        };
        let Some(server) = self.registry.server_for(&tool_name) else {
            self.emit_failed(
                &run_id,
                &request_id,
                &tool_name,
                "schema_violation",
                json!({"error": "unknown_server"}),
                0,
            )
            .await;
            return;
        };

        let started = Instant::now();

        if let Err(error) = server.validate(&tool_name, &arguments) {
            warn!(%tool_name, %error, "tool argument validation failed");
            self.emit_failed(
                &run_id,
                &request_id,
                &tool_name,
                "schema_violation",
                json!({"error": "invalid_arguments", "detail": error.to_string()}),
                duration_ms(started),
            )
            .await;
            return;
        }

        if let Err(reason) = self.gate.check(&descriptor.permission_scope) {
            info!(%tool_name, scope = %descriptor.permission_scope, %reason, "tool denied");
            let payload = ToolDeniedPayload {
                request_id,
                tool_name,
                permission_scope: descriptor.permission_scope,
                reason,
            };
            self.publish(Event::from_payload(
                event_types::TOOL_DENIED,
                run_id,
                &payload,
            ))
            .await;
            return;
        }

        let cache_key = if descriptor.read_only && self.cache.is_some() {
            Some(ToolResultCache::key(&tool_name, &arguments))
        } else {
            None
        };
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(output) = cache.lookup(key) {
                self.emit_completed(&run_id, &request_id, &tool_name, output, 0)
                    .await;
                return;
            }
        }

        let outcome = tokio::time::timeout(
            self.invoke_timeout,
            server.invoke(&tool_name, &arguments),
        )
        .await;

        // One retry with jitter on an application error; the second
        // occurrence is surfaced as a server error.
        let outcome = match outcome {
            Ok(Err(ToolServerError::Application(first))) => {
                let jitter = {
                    let mut rng = rand::thread_rng();
                    Duration::from_millis(rng.gen_range(50..200))
                };
                warn!(%tool_name, "tool application error; retrying once");
                tokio::time::sleep(jitter).await;
                match tokio::time::timeout(
                    self.invoke_timeout,
                    server.invoke(&tool_name, &arguments),
                )
                .await
                {
                    Ok(Err(ToolServerError::Application(_))) => {
                        Ok(Err(ToolServerError::Application(first)))
                    }
                    retried => retried,
                }
            }
            other => other,
        };

        match outcome {
            Err(_elapsed) => {
                self.emit_failed(
                    &run_id,
                    &request_id,
                    &tool_name,
                    "timeout",
                    json!({"error": "timeout"}),
                    duration_ms(started),
                )
                .await;
            }
            Ok(Ok(output)) => {
                if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
                    cache.store(key, output.clone());
                }
                self.emit_completed(&run_id, &request_id, &tool_name, output, duration_ms(started))
                    .await;
            }
            Ok(Err(ToolServerError::Application(error))) => {
                let payload = ToolServerErrorPayload {
                    request_id: request_id.clone(),
                    server_id: descriptor.server_id.clone(),
                    error: error.clone(),
                };
                self.publish(Event::from_payload(
                    event_types::TOOL_SERVER_ERROR,
                    run_id.clone(),
                    &payload,
                ))
                .await;
                self.emit_failed(
                    &run_id,
                    &request_id,
                    &tool_name,
                    "server_error",
                    error,
                    duration_ms(started),
                )
                .await;
            }
            Ok(Err(ToolServerError::Transport(message))) => {
                self.emit_failed(
                    &run_id,
                    &request_id,
                    &tool_name,
                    "transport",
                    json!({"error": "transport", "detail": message}),
                    duration_ms(started),
                )
                .await;
            }
            Ok(Err(error)) => {
                self.emit_failed(
                    &run_id,
                    &request_id,
                    &tool_name,
                    "schema_violation",
                    json!({"error": error.to_string()}),
                    duration_ms(started),
                )
                .await;
            }
        }
    }

    async fn emit_completed(
        &self,
        run_id: &str,
        request_id: &str,
        tool_name: &str,
        output: Value,
        duration_ms: u64,
    ) {
        info!(%tool_name, duration_ms, "tool completed");
        let payload = ToolCompletedPayload {
            request_id: request_id.to_string(),
            tool_name: tool_name.to_string(),
            output,
            duration_ms,
        };
        self.publish(Event::from_payload(
            event_types::TOOL_COMPLETED,
            run_id,
            &payload,
        ))
        .await;
    }

    async fn emit_failed(
        &self,
        run_id: &str,
        request_id: &str,
        tool_name: &str,
        error_kind: &str,
        error: Value,
        duration_ms: u64,
    ) {
        info!(%tool_name, error_kind, duration_ms, "tool failed");
        let payload = ToolFailedPayload {
            request_id: request_id.to_string(),
            tool_name: tool_name.to_string(),
            error_kind: error_kind.to_string(),
            error,
            duration_ms,
        };
        self.publish(Event::from_payload(event_types::TOOL_FAILED, run_id, &payload))
            .await;
    }

    async fn publish(&self, event: Event) {
        let run_id = event.run_id.clone();
        let event_type = event.event_type.clone();
        if let Err(error) = self.bus.publish(event).await {
            warn!(%run_id, %event_type, %error, "failed to publish tool event");
        }
    }
}
