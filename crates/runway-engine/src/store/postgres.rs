//! PostgreSQL persistence for distributed mode
//!
//! One module hosts every Postgres-backed piece: the ordered event store,
//! the notify-channel transport, snapshot stores, the key-scoped run lease,
//! and the durable tool queue. The event store remains the source of truth;
//! the notify channel is fan-out only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runway_core::{Event, RunState, WorkflowState};
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::Row;
use tokio::sync::mpsc;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use super::{EventStore, StoreError};
use crate::bus::{EventTransport, LocalTransport};
use crate::lease::RunLease;
use crate::queue::{QueueDelivery, QueueError, ToolQueue, ToolQueueConsumer};
use crate::snapshots::{SnapshotError, StateStore, WorkflowStore};

const NOTIFY_CHANNEL: &str = "runway_events";
/// pg_notify payloads are capped at 8000 bytes; larger events are sent as a
/// (run_id, seq) reference the listener resolves against the store.
const NOTIFY_INLINE_LIMIT: usize = 7500;

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn snap_err(e: sqlx::Error) -> SnapshotError {
    SnapshotError::Unavailable(e.to_string())
}

/// Create the schema used by every Postgres-backed component.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS run_events (
            run_id TEXT NOT NULL,
            seq BIGINT NOT NULL,
            event JSONB NOT NULL,
            PRIMARY KEY (run_id, seq)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS run_state (
            run_id TEXT PRIMARY KEY,
            state JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS workflow_state (
            run_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            state JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS run_leases (
            key TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tool_queue (
            id BIGSERIAL PRIMARY KEY,
            request_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            event JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            claimed_by TEXT,
            claimed_at TIMESTAMPTZ,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tool_processed (
            request_id TEXT PRIMARY KEY,
            processed_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await.map_err(db_err)?;
    }
    Ok(())
}

// =============================================================================
// Event store
// =============================================================================

/// Ordered per-run event log in `run_events`.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, event), fields(run_id = %event.run_id, event_type = %event.event_type))]
    async fn append(&self, mut event: Event) -> Result<Event, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serialize writers per run without locking an aggregate row.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&event.run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS last_seq FROM run_events WHERE run_id = $1")
            .bind(&event.run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let last_seq: i64 = row.get("last_seq");
        event.seq = (last_seq + 1) as u64;

        let payload =
            serde_json::to_value(&event).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query("INSERT INTO run_events (run_id, seq, event) VALUES ($1, $2, $3)")
            .bind(&event.run_id)
            .bind(event.seq as i64)
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(event)
    }

    async fn history(&self, run_id: &str) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query("SELECT event FROM run_events WHERE run_id = $1 ORDER BY seq")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: Value = row.get("event");
            match serde_json::from_value(payload) {
                Ok(event) => events.push(event),
                Err(_) => warn!(%run_id, "skipping malformed stored event"),
            }
        }
        Ok(events)
    }
}

// =============================================================================
// Notify transport
// =============================================================================

/// Topic-channel fan-out over `pg_notify` / `LISTEN`.
///
/// Subscribers in every process (including the publisher's own) receive
/// events through the listener task; replay-overlap is handled by the bus's
/// seq dedupe.
pub struct PostgresTransport {
    pool: PgPool,
    local: LocalTransport,
}

impl PostgresTransport {
    /// Connect the listener and start dispatching notifications.
    pub async fn connect(pool: PgPool) -> Result<Arc<Self>, StoreError> {
        let mut listener = PgListener::connect_with(&pool).await.map_err(db_err)?;
        listener.listen(NOTIFY_CHANNEL).await.map_err(db_err)?;

        let transport = Arc::new(Self {
            pool,
            local: LocalTransport::new(),
        });

        let dispatcher = Arc::clone(&transport);
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        dispatcher.dispatch(notification.payload()).await;
                    }
                    Err(error) => {
                        error!(%error, "event listener connection lost; retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok(transport)
    }

    async fn dispatch(&self, payload: &str) {
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(_) => {
                warn!("skipping malformed event notification");
                return;
            }
        };

        let event = if let Some(reference) = value.get("ref") {
            // Oversized event: resolve the reference against the store.
            let run_id = reference.get("run_id").and_then(Value::as_str).unwrap_or_default();
            let seq = reference.get("seq").and_then(Value::as_u64).unwrap_or(0);
            match self.load_event(run_id, seq).await {
                Some(event) => event,
                None => return,
            }
        } else {
            match serde_json::from_value(value) {
                Ok(event) => event,
                Err(_) => {
                    warn!("skipping undecodable event notification");
                    return;
                }
            }
        };
        self.local.broadcast(&event).await;
    }

    async fn load_event(&self, run_id: &str, seq: u64) -> Option<Event> {
        let row = sqlx::query("SELECT event FROM run_events WHERE run_id = $1 AND seq = $2")
            .bind(run_id)
            .bind(seq as i64)
            .fetch_optional(&self.pool)
            .await
            .ok()??;
        let payload: Value = row.get("event");
        serde_json::from_value(payload).ok()
    }
}

#[async_trait]
impl EventTransport for PostgresTransport {
    async fn broadcast(&self, event: &Event) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) if payload.len() <= NOTIFY_INLINE_LIMIT => payload,
            Ok(_) => serde_json::json!({"ref": {"run_id": event.run_id, "seq": event.seq}})
                .to_string(),
            Err(error) => {
                warn!(%error, "failed to encode event for notify");
                return;
            }
        };
        if let Err(error) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await
        {
            // Best effort only; subscribers recover via replay.
            warn!(%error, "pg_notify failed");
        }
    }

    fn subscribe(&self, run_id: &str) -> mpsc::Receiver<Event> {
        self.local.subscribe(run_id)
    }

    fn subscribe_all(&self) -> mpsc::Receiver<Event> {
        self.local.subscribe_all()
    }
}

// =============================================================================
// Snapshot stores
// =============================================================================

#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn save(&self, state: &RunState) -> Result<(), SnapshotError> {
        let payload = serde_json::to_value(state)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO run_state (run_id, state, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (run_id) DO UPDATE SET state = EXCLUDED.state, updated_at = now()
            "#,
        )
        .bind(&state.run_id)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(snap_err)?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>, SnapshotError> {
        let row = sqlx::query("SELECT state FROM run_state WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(snap_err)?;
        Ok(row.and_then(|row| {
            let payload: Value = row.get("state");
            serde_json::from_value(payload).ok()
        }))
    }
}

#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), SnapshotError> {
        let payload = serde_json::to_value(state)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO workflow_state (run_id, status, state, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (run_id)
            DO UPDATE SET status = EXCLUDED.status, state = EXCLUDED.state, updated_at = now()
            "#,
        )
        .bind(&state.run_id)
        .bind(state.status.as_str())
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(snap_err)?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, SnapshotError> {
        let row = sqlx::query("SELECT state FROM workflow_state WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(snap_err)?;
        Ok(row.and_then(|row| {
            let payload: Value = row.get("state");
            serde_json::from_value(payload).ok()
        }))
    }

    async fn list_incomplete(&self) -> Result<Vec<WorkflowState>, SnapshotError> {
        let rows = sqlx::query(
            r#"
            SELECT state FROM workflow_state
            WHERE status NOT IN ('completed', 'failed')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(snap_err)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let payload: Value = row.get("state");
                serde_json::from_value(payload).ok()
            })
            .collect())
    }
}

// =============================================================================
// Run lease
// =============================================================================

/// Key-scoped lease with a TTL; expired leases are taken over.
pub struct PostgresRunLease {
    pool: PgPool,
    owner: String,
    ttl: Duration,
}

impl PostgresRunLease {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            owner: format!("runway-{}", Uuid::new_v4()),
            ttl,
        }
    }
}

#[async_trait]
impl RunLease for PostgresRunLease {
    async fn acquire(&self, key: &str) -> bool {
        let result = sqlx::query(
            r#"
            INSERT INTO run_leases (key, owner, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE run_leases.expires_at < now() OR run_leases.owner = EXCLUDED.owner
            RETURNING owner
            "#,
        )
        .bind(key)
        .bind(&self.owner)
        .bind(self.ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await;
        matches!(result, Ok(Some(_)))
    }

    async fn refresh(&self, key: &str) -> bool {
        let result = sqlx::query(
            r#"
            UPDATE run_leases SET expires_at = now() + make_interval(secs => $3)
            WHERE key = $1 AND owner = $2
            "#,
        )
        .bind(key)
        .bind(&self.owner)
        .bind(self.ttl.as_secs_f64())
        .execute(&self.pool)
        .await;
        matches!(result, Ok(done) if done.rows_affected() > 0)
    }

    async fn release(&self, key: &str) {
        let _ = sqlx::query("DELETE FROM run_leases WHERE key = $1 AND owner = $2")
            .bind(key)
            .bind(&self.owner)
            .execute(&self.pool)
            .await;
    }
}

// =============================================================================
// Tool queue
// =============================================================================

/// Durable tool queue in `tool_queue` with consumer-group semantics:
/// `SKIP LOCKED` claims, visibility-timeout reclamation, and a durable
/// processed-marker table for request-id dedupe.
#[derive(Clone)]
pub struct PostgresToolQueue {
    pool: PgPool,
}

impl PostgresToolQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ToolQueue for PostgresToolQueue {
    async fn enqueue(&self, event: &Event) -> Result<(), QueueError> {
        let request_id = event.data_str("request_id").unwrap_or_default();
        let payload = serde_json::to_value(event)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO tool_queue (request_id, run_id, event) VALUES ($1, $2, $3)",
        )
        .bind(request_id)
        .bind(&event.run_id)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ToolQueueConsumer for PostgresToolQueue {
    async fn claim(&self, consumer: &str, max: usize) -> Result<Vec<QueueDelivery>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE tool_queue
            SET status = 'claimed', claimed_by = $1, claimed_at = now()
            WHERE id IN (
                SELECT id FROM tool_queue
                WHERE status = 'pending'
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event
            "#,
        )
        .bind(consumer)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            let delivery_id: i64 = row.get("id");
            let payload: Value = row.get("event");
            match serde_json::from_value(payload) {
                Ok(event) => deliveries.push(QueueDelivery { delivery_id, event }),
                Err(_) => warn!(delivery_id, "skipping malformed queue entry"),
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery_id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM tool_queue WHERE id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn mark_processed(&self, request_id: &str) -> Result<bool, QueueError> {
        let done = sqlx::query(
            "INSERT INTO tool_processed (request_id) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(request_id)
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(done.rows_affected() > 0)
    }

    async fn reclaim_stale(&self, visibility: Duration) -> Result<u64, QueueError> {
        let done = sqlx::query(
            r#"
            UPDATE tool_queue
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL
            WHERE status = 'claimed' AND claimed_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(visibility.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(done.rows_affected())
    }
}

// =============================================================================
// Aggregate wiring
// =============================================================================

/// Every Postgres-backed component over one shared pool.
pub struct PostgresStores {
    pub pool: PgPool,
    pub event_store: Arc<PostgresEventStore>,
    pub state_store: Arc<PostgresStateStore>,
    pub workflow_store: Arc<PostgresWorkflowStore>,
    pub transport: Arc<PostgresTransport>,
    pub lease: Arc<PostgresRunLease>,
    pub tool_queue: Arc<PostgresToolQueue>,
}

impl PostgresStores {
    /// Connect, create the schema, and start the notify listener.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(db_err)?;
        ensure_schema(&pool).await?;

        let event_store = Arc::new(PostgresEventStore::new(pool.clone()));
        let transport = PostgresTransport::connect(pool.clone()).await?;

        Ok(Self {
            event_store,
            state_store: Arc::new(PostgresStateStore { pool: pool.clone() }),
            workflow_store: Arc::new(PostgresWorkflowStore { pool: pool.clone() }),
            transport,
            lease: Arc::new(PostgresRunLease::new(pool.clone(), Duration::from_secs(30))),
            tool_queue: Arc::new(PostgresToolQueue::new(pool.clone())),
            pool,
        })
    }
}
