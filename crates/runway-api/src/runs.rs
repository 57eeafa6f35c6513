// Run lifecycle HTTP routes
// Events are served as SSE: full replay first, then live until terminal.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use runway_core::{ChatMode, Identity};
use runway_engine::{AdmissionError, EngineError, StartRunRequest};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use utoipa::ToSchema;

use crate::app::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(create_run))
        .route("/runs/:run_id/events", get(stream_events))
        .route("/runs/:run_id/state", get(get_run_state))
        .route("/runs/:run_id/workflow", get(get_workflow_state))
        .route("/runs/:run_id/approval", post(record_approval))
        .with_state(state)
}

// ============================================
// Request / response bodies
// ============================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateRunRequest {
    pub message: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub identity: IdentityBody,
}

fn default_mode() -> String {
    "answer".to_string()
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct IdentityBody {
    pub tenant_id: String,
    pub user_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateRunResponse {
    pub run_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApprovalRequest {
    pub decision: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

fn error_body(error: impl Into<String>) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: error.into(),
    })
}

// ============================================
// Handlers
// ============================================

/// POST /runs - admit and start a run
#[utoipa::path(
    post,
    path = "/runs",
    request_body = CreateRunRequest,
    params(("X-Run-Id" = Option<String>, Header, description = "Caller-supplied run id")),
    responses(
        (status = 201, description = "Run admitted", body = CreateRunResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 429, description = "Concurrency cap reached", body = ErrorBody),
    ),
    tag = "runs"
)]
pub async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<CreateRunResponse>), (StatusCode, Json<ErrorBody>)> {
    let Some(mode) = ChatMode::parse(&body.mode) else {
        return Err((StatusCode::BAD_REQUEST, error_body("unknown mode")));
    };
    let run_id = headers
        .get("X-Run-Id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let request = StartRunRequest {
        run_id,
        message: body.message,
        context: body.context,
        mode,
        identity: Identity {
            tenant_id: body.identity.tenant_id,
            user_id: body.identity.user_id,
        },
    };

    match state.runtime.coordinator.start_run(request).await {
        Ok(run_id) => Ok((StatusCode::CREATED, Json(CreateRunResponse { run_id }))),
        Err(AdmissionError::EmptyMessage) => {
            Err((StatusCode::BAD_REQUEST, error_body("message must not be empty")))
        }
        Err(AdmissionError::RateLimited { scope }) => Err((
            StatusCode::TOO_MANY_REQUESTS,
            error_body(format!("rate limited at {scope} scope")),
        )),
        Err(error) => {
            tracing::error!(%error, "failed to start run");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal error"),
            ))
        }
    }
}

/// GET /runs/{run_id}/events - replay plus live event stream
#[utoipa::path(
    get,
    path = "/runs/{run_id}/events",
    params(("run_id" = String, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream"),
        (status = 404, description = "Run not found", body = ErrorBody),
    ),
    tag = "runs"
)]
pub async fn stream_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, Json<ErrorBody>)> {
    let history = state
        .runtime
        .bus
        .store()
        .history(&run_id)
        .await
        .map_err(|error| {
            tracing::error!(%run_id, %error, "failed to read history");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal error"),
            )
        })?;
    if history.is_empty() {
        return Err((StatusCode::NOT_FOUND, error_body("run not found")));
    }

    let rx = state
        .runtime
        .bus
        .subscribe(&run_id)
        .await
        .map_err(|error| {
            tracing::error!(%run_id, %error, "failed to subscribe");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal error"),
            )
        })?;

    tracing::info!(%run_id, "starting event stream");
    let stream = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        let sse = SseEvent::default()
            .event(&event.event_type)
            .id(event.seq.to_string())
            .data(payload);
        Some((Ok(sse), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /runs/{run_id}/state - current run snapshot
#[utoipa::path(
    get,
    path = "/runs/{run_id}/state",
    params(("run_id" = String, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run snapshot"),
        (status = 404, description = "Run not found", body = ErrorBody),
    ),
    tag = "runs"
)]
pub async fn get_run_state(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    let snapshot = state
        .runtime
        .projector
        .load(&run_id)
        .await
        .map_err(|error| {
            tracing::error!(%run_id, %error, "failed to load snapshot");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal error"),
            )
        })?
        .ok_or_else(|| (StatusCode::NOT_FOUND, error_body("run not found")))?;
    let payload = serde_json::to_value(&snapshot)
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, error_body("internal error")))?;
    Ok(Json(payload))
}

/// GET /runs/{run_id}/workflow - current workflow record
#[utoipa::path(
    get,
    path = "/runs/{run_id}/workflow",
    params(("run_id" = String, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Workflow record"),
        (status = 404, description = "Run not found", body = ErrorBody),
    ),
    tag = "runs"
)]
pub async fn get_workflow_state(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    let workflow = state
        .runtime
        .workflow_store
        .load(&run_id)
        .await
        .map_err(|error| {
            tracing::error!(%run_id, %error, "failed to load workflow record");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal error"),
            )
        })?
        .ok_or_else(|| (StatusCode::NOT_FOUND, error_body("run not found")))?;
    let payload = serde_json::to_value(&workflow)
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, error_body("internal error")))?;
    Ok(Json(payload))
}

/// POST /runs/{run_id}/approval - record a human decision
#[utoipa::path(
    post,
    path = "/runs/{run_id}/approval",
    params(("run_id" = String, Path, description = "Run ID")),
    request_body = ApprovalRequest,
    responses(
        (status = 202, description = "Decision recorded"),
        (status = 400, description = "Invalid decision", body = ErrorBody),
        (status = 404, description = "Run not found", body = ErrorBody),
        (status = 409, description = "Run already terminated", body = ErrorBody),
    ),
    tag = "runs"
)]
pub async fn record_approval(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<ApprovalRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    if !matches!(body.decision.as_str(), "approved" | "rejected") {
        return Err((
            StatusCode::BAD_REQUEST,
            error_body("decision must be approved or rejected"),
        ));
    }
    match state
        .runtime
        .engine
        .record_approval(&run_id, &body.decision)
        .await
    {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(EngineError::RunNotFound(_)) => {
            Err((StatusCode::NOT_FOUND, error_body("run not found")))
        }
        Err(EngineError::RunTerminated(_)) => Err((
            StatusCode::CONFLICT,
            error_body("run already terminated"),
        )),
        Err(error) => {
            tracing::error!(%run_id, %error, "failed to record approval");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal error"),
            ))
        }
    }
}
