//! Application state and router assembly

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use runway_engine::Runtime;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::runs;

/// App state shared across routes.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    mode: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        mode: state.runtime.settings.mode.as_str().to_string(),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        runs::create_run,
        runs::stream_events,
        runs::get_run_state,
        runs::get_workflow_state,
        runs::record_approval,
    ),
    components(schemas(
        runs::CreateRunRequest,
        runs::IdentityBody,
        runs::CreateRunResponse,
        runs::ApprovalRequest,
        runs::ErrorBody,
    )),
    tags((name = "runs", description = "Run lifecycle endpoints")),
    info(
        title = "Runway API",
        version = "0.1.0",
        description = "Durable event-driven run engine"
    )
)]
struct ApiDoc;

/// Build the full router over the assembled runtime.
pub fn build_router(runtime: Arc<Runtime>) -> Router {
    let state = AppState { runtime };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health).with_state(state.clone()))
        .merge(runs::routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
