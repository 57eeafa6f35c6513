//! Postgres-backed store integration tests
//!
//! These need a reachable database:
//!
//! ```text
//! EVENT_STORE_URL=postgres://localhost/runway_test \
//!     cargo test -p runway-engine --test postgres_integration -- --ignored
//! ```

use std::time::Duration;

use runway_core::{event_types, Event};
use runway_engine::{EventStore, PostgresStores, RunLease, ToolQueue, ToolQueueConsumer};
use serde_json::json;
use uuid::Uuid;

async fn stores() -> PostgresStores {
    let url = std::env::var("EVENT_STORE_URL").expect("EVENT_STORE_URL must be set");
    PostgresStores::connect(&url).await.expect("connect")
}

#[tokio::test]
#[ignore]
async fn test_append_assigns_contiguous_seq() {
    let stores = stores().await;
    let run_id = format!("pg-run-{}", Uuid::new_v4());

    for expected in 1..=3u64 {
        let stored = stores
            .event_store
            .append(Event::new(
                event_types::OUTPUT_CHUNK,
                run_id.clone(),
                json!({"text": "x"}),
            ))
            .await
            .expect("append");
        assert_eq!(stored.seq, expected);
    }

    let history = stores.event_store.history(&run_id).await.expect("history");
    let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
#[ignore]
async fn test_queue_claim_ack_and_dedupe() {
    let stores = stores().await;
    let run_id = format!("pg-run-{}", Uuid::new_v4());
    let request_id = format!("{run_id}:plan:1");

    let event = Event::new(
        event_types::TOOL_REQUESTED,
        run_id.clone(),
        json!({
            "request_id": request_id,
            "tool_name": "calculator",
            "server_id": "calculator_server",
            "permission_scope": "calculator.execute",
            "arguments": {"operation": "add", "a": 1.0, "b": 2.0},
        }),
    );
    stores.tool_queue.enqueue(&event).await.expect("enqueue");

    let consumer = format!("worker-{}", Uuid::new_v4());
    let claimed = stores
        .tool_queue
        .claim(&consumer, 10)
        .await
        .expect("claim");
    let delivery = claimed
        .iter()
        .find(|d| d.event.run_id == run_id)
        .expect("our entry claimed");

    assert!(stores
        .tool_queue
        .mark_processed(&request_id)
        .await
        .expect("first marker"));
    assert!(!stores
        .tool_queue
        .mark_processed(&request_id)
        .await
        .expect("second marker is a redelivery"));

    stores
        .tool_queue
        .ack(delivery.delivery_id)
        .await
        .expect("ack");
}

#[tokio::test]
#[ignore]
async fn test_stale_claims_are_reclaimed() {
    let stores = stores().await;
    let run_id = format!("pg-run-{}", Uuid::new_v4());
    let event = Event::new(
        event_types::TOOL_REQUESTED,
        run_id.clone(),
        json!({"request_id": format!("{run_id}:plan:1"), "tool_name": "calculator"}),
    );
    stores.tool_queue.enqueue(&event).await.expect("enqueue");

    let consumer = format!("worker-{}", Uuid::new_v4());
    let claimed = stores.tool_queue.claim(&consumer, 10).await.expect("claim");
    assert!(claimed.iter().any(|d| d.event.run_id == run_id));

    // Zero visibility: every claim is immediately stale.
    let reclaimed = stores
        .tool_queue
        .reclaim_stale(Duration::ZERO)
        .await
        .expect("reclaim");
    assert!(reclaimed >= 1);

    let reclaimed_entries = stores
        .tool_queue
        .claim(&format!("worker-{}", Uuid::new_v4()), 50)
        .await
        .expect("second claim");
    assert!(reclaimed_entries.iter().any(|d| d.event.run_id == run_id));
}

#[tokio::test]
#[ignore]
async fn test_lease_is_exclusive_per_key() {
    let url = std::env::var("EVENT_STORE_URL").expect("EVENT_STORE_URL must be set");
    let first = PostgresStores::connect(&url).await.expect("connect");
    let second = PostgresStores::connect(&url).await.expect("connect");
    let key = format!("workflow:pg-run-{}", Uuid::new_v4());

    assert!(first.lease.acquire(&key).await);
    assert!(!second.lease.acquire(&key).await, "held lease is exclusive");
    assert!(first.lease.refresh(&key).await);

    first.lease.release(&key).await;
    assert!(second.lease.acquire(&key).await, "released lease is takeable");
    second.lease.release(&key).await;
}
