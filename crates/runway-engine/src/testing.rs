//! Deterministic fixtures for exercising the engine in tests
//!
//! Fault-injecting collaborators plus helpers for building a fast local
//! runtime and observing a run to completion.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use runway_core::{Event, RetryPolicy, Settings, Step};

use crate::bus::EventBus;
use crate::collab::{
    ModelError, ModelOutput, ModelRequest, ModelStreamer, RetrievalError, Retriever,
};
use crate::model::TemplateModel;
use crate::store::StoreError;

/// Model that fails transiently a fixed number of times, then delegates.
pub struct FlakyModel {
    failures_remaining: AtomicU32,
    inner: TemplateModel,
}

impl FlakyModel {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(times),
            inner: TemplateModel::new(),
        }
    }
}

#[async_trait]
impl ModelStreamer for FlakyModel {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelOutput, ModelError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ModelError::Transient("injected model failure".to_string()));
        }
        self.inner.generate(request).await
    }
}

/// Model that always answers with the same text.
pub struct StaticModel {
    text: String,
}

impl StaticModel {
    pub fn answering(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl ModelStreamer for StaticModel {
    async fn generate(&self, _request: ModelRequest<'_>) -> Result<ModelOutput, ModelError> {
        Ok(ModelOutput {
            text: self.text.clone(),
            cost_usd: 0.0001,
        })
    }
}

/// Model whose call never returns; simulates an in-flight crash window.
pub struct PendingModel;

#[async_trait]
impl ModelStreamer for PendingModel {
    async fn generate(&self, _request: ModelRequest<'_>) -> Result<ModelOutput, ModelError> {
        futures::future::pending::<()>().await;
        unreachable!("pending future never resolves")
    }
}

/// Retriever that is always unavailable.
pub struct FailingRetriever;

#[async_trait]
impl Retriever for FailingRetriever {
    async fn query(
        &self,
        _query: &str,
        _top_k: usize,
    ) -> Result<Vec<runway_core::RetrievedChunk>, RetrievalError> {
        Err(RetrievalError::Transient("injected retrieval outage".to_string()))
    }
}

/// Single-process settings rooted in a temp directory, with retry backoffs
/// shrunk to keep tests fast.
pub fn test_settings(data_dir: PathBuf) -> Settings {
    let mut settings = Settings {
        data_dir,
        ..Settings::default()
    };
    settings
        .retries
        .set(Step::Plan, RetryPolicy::new(2, Duration::from_millis(10)));
    settings
        .retries
        .set(Step::Retrieve, RetryPolicy::new(3, Duration::from_millis(10)));
    settings
        .retries
        .set(Step::Respond, RetryPolicy::new(3, Duration::from_millis(10)));
    settings
        .retries
        .set(Step::Verify, RetryPolicy::new(2, Duration::from_millis(10)));
    settings
}

/// Subscribe to a run and collect events until the terminal event (which is
/// included) or the timeout elapses.
pub async fn collect_until_terminal(
    bus: &EventBus,
    run_id: &str,
    timeout: Duration,
) -> Result<Vec<Event>, StoreError> {
    let mut rx = bus.subscribe(run_id).await?;
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::select! {
            maybe = rx.recv() => maybe,
            _ = tokio::time::sleep_until(deadline) => None,
        };
        match event {
            Some(event) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(events)
}

/// Event-type sequence helper for assertions.
pub fn types_of(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}
