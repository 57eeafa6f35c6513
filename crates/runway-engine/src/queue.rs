//! Durable tool queue (distributed variant)
//!
//! In single-process mode tool requests reach the executor through the
//! in-process bus subscription. Across processes they flow through a
//! durable queue with at-least-once delivery: claims carry a visibility
//! timeout, stuck entries are reassigned, and consumers deduplicate by
//! `request_id` before executing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runway_core::Event;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::executor::ToolExecutor;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("tool queue unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Producer half: called by the bus after a `tool.requested` event is
/// persisted.
#[async_trait]
pub trait ToolQueue: Send + Sync + 'static {
    async fn enqueue(&self, event: &Event) -> Result<(), QueueError>;
}

/// A claimed queue entry awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct QueueDelivery {
    pub delivery_id: i64,
    pub event: Event,
}

/// Consumer half with claim/ack semantics.
#[async_trait]
pub trait ToolQueueConsumer: Send + Sync + 'static {
    /// Claim up to `max` pending entries for this consumer. Claimed entries
    /// become invisible to other consumers until the visibility timeout
    /// lapses.
    async fn claim(&self, consumer: &str, max: usize) -> Result<Vec<QueueDelivery>, QueueError>;

    /// Acknowledge a processed delivery.
    async fn ack(&self, delivery_id: i64) -> Result<(), QueueError>;

    /// Durable dedupe marker. Returns true the first time a request id is
    /// recorded; redeliveries return false and are skipped.
    async fn mark_processed(&self, request_id: &str) -> Result<bool, QueueError>;

    /// Return stuck claims (no ack within `visibility`) to the pending
    /// state so another worker retries them.
    async fn reclaim_stale(&self, visibility: Duration) -> Result<u64, QueueError>;
}

/// Producer + consumer pair over one Postgres-backed queue, as handed to
/// the runtime assembly.
#[derive(Clone)]
pub struct PostgresQueueHandle {
    queue: Arc<crate::store::PostgresToolQueue>,
}

impl PostgresQueueHandle {
    pub fn new(queue: Arc<crate::store::PostgresToolQueue>) -> Self {
        Self { queue }
    }

    pub fn producer(&self) -> Arc<dyn ToolQueue> {
        self.queue.clone()
    }

    pub fn consumer(&self) -> Arc<dyn ToolQueueConsumer> {
        self.queue.clone()
    }
}

/// Configuration for a queue worker loop.
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    pub consumer_name: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            consumer_name: format!("tool-worker-{}", uuid::Uuid::new_v4()),
            batch_size: 10,
            poll_interval: Duration::from_millis(200),
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// Drains the durable queue and hands each deduplicated request to the
/// executor.
pub struct ToolQueueWorker {
    consumer: Arc<dyn ToolQueueConsumer>,
    executor: Arc<ToolExecutor>,
    config: QueueWorkerConfig,
}

impl ToolQueueWorker {
    pub fn new(
        consumer: Arc<dyn ToolQueueConsumer>,
        executor: Arc<ToolExecutor>,
        config: QueueWorkerConfig,
    ) -> Self {
        Self {
            consumer,
            executor,
            config,
        }
    }

    /// Consume until the shutdown signal flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(consumer = %self.config.consumer_name, "tool queue worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(error) = self.consumer.reclaim_stale(self.config.visibility_timeout).await
            {
                warn!(%error, "stale claim reclamation failed");
            }

            let deliveries = match self
                .consumer
                .claim(&self.config.consumer_name, self.config.batch_size)
                .await
            {
                Ok(deliveries) => deliveries,
                Err(error) => {
                    warn!(%error, "tool queue claim failed");
                    Vec::new()
                }
            };

            if deliveries.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for delivery in deliveries {
                self.process(delivery).await;
            }
        }
        info!(consumer = %self.config.consumer_name, "tool queue worker stopped");
    }

    async fn process(&self, delivery: QueueDelivery) {
        let request_id = delivery
            .event
            .data_str("request_id")
            .unwrap_or_default()
            .to_string();

        match self.consumer.mark_processed(&request_id).await {
            Ok(true) => {
                self.executor.execute_request(&delivery.event).await;
            }
            Ok(false) => {
                // Redelivery of an already-processed request; drop it.
            }
            Err(error) => {
                warn!(%request_id, %error, "dedupe marker failed; leaving delivery unacked");
                return;
            }
        }

        if let Err(error) = self.consumer.ack(delivery.delivery_id).await {
            warn!(delivery_id = delivery.delivery_id, %error, "tool queue ack failed");
        }
    }
}
