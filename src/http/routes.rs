//! Route table and handlers.

use std::time::Instant;

use axum::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;

use super::models::*;
use super::state::AppState;
use crate::core::files::ValidationReport;
use crate::core::task::{Task, TaskId};
use crate::orchestrator::FileInput;

/// Header carrying the authenticated caller, set by the fronting proxy.
pub const USER_HEADER: &str = "x-user-id";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(submit_handler))
        .route("/tasks/:id", get(get_handler))
        .route("/tasks/:id/approve", post(approve_handler))
        .route("/tasks/:id/rollback", post(rollback_handler))
        .route("/tasks/:id/cancel", post(cancel_handler))
        .route("/validate", post(validate_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Caller identity from [`USER_HEADER`]; missing or blank is a 400.
pub struct Caller(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_string()))
            .ok_or_else(|| ApiError::bad_request(format!("missing {} header", USER_HEADER)))
    }
}

fn parse_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid task id: {}", raw)))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

/// POST /tasks
async fn submit_handler(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let req = body(payload)?;
    let task = state.orchestrator.submit(&caller, &req.prompt, req.auto_approve).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            task_id: task.id,
            status: task.status,
        }),
    ))
}

/// GET /tasks/:id
async fn get_handler(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.orchestrator.get(parse_id(&id)?, &caller).await?))
}

/// POST /tasks/:id/approve
async fn approve_handler(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.orchestrator.approve(parse_id(&id)?, &caller).await?))
}

/// POST /tasks/:id/rollback
async fn rollback_handler(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.orchestrator.rollback(parse_id(&id)?, &caller).await?))
}

/// POST /tasks/:id/cancel
async fn cancel_handler(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.orchestrator.cancel(parse_id(&id)?, &caller).await?))
}

/// POST /validate
async fn validate_handler(
    State(state): State<AppState>,
    Caller(_caller): Caller,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Result<Json<ValidationReport>, ApiError> {
    let req = body(payload)?;
    let files = req
        .files
        .into_iter()
        .map(|f| FileInput {
            path: f.path,
            content: f.content,
        })
        .collect();
    Ok(Json(state.orchestrator.validate_files(files).await?))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
        tool_budget: state.orchestrator.tools().limiter().remaining(),
    })
}

pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    info!(
        %method,
        path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "HTTP request"
    );
    response
}
