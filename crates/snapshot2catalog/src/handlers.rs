// HTTP request handlers for the trigger interface

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use snapshot2catalog_core::{Environment, Purpose, RunId};
use tracing::{info, warn};

use crate::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct TriggerRequest {
    environment: Environment,
    purpose: Purpose,
}

/// POST /v1/trigger - start or resume a Run
pub(crate) async fn trigger(
    State(state): State<AppState>,
    payload: Result<Json<TriggerRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(AppError::bad_request)?;
    metrics::counter!(
        "snapshot2catalog.triggers",
        "environment" => request.environment.as_str(),
        "purpose" => request.purpose.as_str()
    )
    .increment(1);
    let run_id = state
        .scheduler
        .trigger(request.environment, request.purpose)?;
    info!(
        run_id = %run_id,
        environment = %request.environment,
        purpose = %request.purpose,
        "Trigger accepted"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "run_id": run_id,
            "environment": request.environment,
            "purpose": request.purpose,
        })),
    )
        .into_response())
}

/// GET /v1/runs - all retained Runs, newest first
pub(crate) async fn list_runs(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "runs": state.scheduler.list() }))
}

/// GET /v1/runs/:id
pub(crate) async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let run = state.scheduler.get(&parse_run_id(&id)?)?;
    Ok(Json(run).into_response())
}

/// POST /v1/runs/:id/cancel
pub(crate) async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let run = state.scheduler.cancel(&parse_run_id(&id)?)?;
    Ok((StatusCode::ACCEPTED, Json(run)).into_response())
}

fn parse_run_id(id: &str) -> Result<RunId, AppError> {
    id.parse::<RunId>()
        .map_err(|e| AppError::bad_request(anyhow::anyhow!("invalid run id '{}': {}", id, e)))
}

/// GET /health - Basic health check
pub(crate) async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

/// GET /ready - Readiness check (staging store connectivity)
pub(crate) async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    for bucket in state.buckets.iter() {
        let checked = match state.staging.operator(bucket) {
            Ok(operator) => operator.check().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = checked {
            warn!(bucket = %bucket, "Staging readiness check failed: {}", e);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "not ready",
                    "staging": "disconnected",
                    "bucket": bucket,
                    "error": e,
                })),
            );
        }
    }
    (
        StatusCode::OK,
        Json(json!({"status": "ready", "environments": state.scheduler.environments()})),
    )
}
