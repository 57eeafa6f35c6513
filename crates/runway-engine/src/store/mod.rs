//! Event log persistence
//!
//! The store is the single writer of sequence numbers: callers hand it an
//! unsequenced [`Event`] and receive back the persisted copy with `seq`
//! assigned. Per run, writers serialize through the store's internal
//! per-run lock; distinct runs are independent.

mod jsonl;
mod postgres;

pub use jsonl::JsonlEventStore;
pub use postgres::{
    PostgresEventStore, PostgresRunLease, PostgresStateStore, PostgresStores, PostgresToolQueue,
    PostgresTransport, PostgresWorkflowStore,
};

use async_trait::async_trait;
use runway_core::Event;

/// Errors from event-log operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Persistence is unreachable or rejected the write. An append that
    /// returns this variant has not been made durable.
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Append-only per-run event log.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Assign the next sequence number for the event's run, persist the
    /// event, and return the stored copy.
    async fn append(&self, event: Event) -> Result<Event, StoreError>;

    /// All stored events for a run in `seq` order.
    async fn history(&self, run_id: &str) -> Result<Vec<Event>, StoreError>;
}
