// Runway API server

use std::sync::Arc;

use anyhow::{Context, Result};
use runway_api::app;
use runway_core::Settings;
use runway_engine::{Collaborators, Runtime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Small built-in corpus so a fresh instance can answer grounded questions
/// before any ingestion has happened.
const SEED_DOCUMENTS: [(&str, &str); 2] = [
    (
        "strategy-basics",
        "Strategy is a plan of action designed to achieve a long-term goal.\n\n\
         Good strategy pairs a clear diagnosis of the situation with a set of \
         coherent actions.",
    ),
    (
        "retrieval-basics",
        "Retrieval-augmented answers cite the evidence chunks they draw from.\n\n\
         When no evidence is available the assistant says so instead of \
         fabricating citations.",
    ),
];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runway_api=info,runway_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env();
    let bind_addr = settings.bind_addr.clone();

    let runtime = Arc::new(
        Runtime::build(settings, Collaborators::default())
            .await
            .context("failed to build runtime")?,
    );
    if let Some(store) = &runtime.retrieval_store {
        for (document_id, text) in SEED_DOCUMENTS {
            store.add_document(document_id, text);
        }
    }
    runtime.start();
    runtime
        .resume_incomplete()
        .await
        .context("failed to resume incomplete workflows")?;

    let router = app::build_router(runtime.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(%bind_addr, "runway api listening");

    axum::serve(listener, router)
        .await
        .context("server terminated")?;
    runtime.shutdown();
    Ok(())
}
