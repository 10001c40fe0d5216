// Server mode - HTTP trigger interface for the snapshot export pipeline
//
// Runs the Scheduler in-process and exposes it over HTTP:
// - Axum HTTP server (HTTP/1.1, HTTP/2)
// - Daily export and catalog cadence
// - Local collaborators backed by the staging store (fs, s3, memory)
// - Structured logging with tracing
// - Graceful shutdown

use anyhow::{Context, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use snapshot2catalog_catalog::StagingStore;
use snapshot2catalog_config::RuntimeConfig;
use snapshot2catalog_core::PipelineError;
use snapshot2catalog_scheduler::Scheduler;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

mod handlers;
mod init;

pub mod local;
pub mod plan;

pub use init::{catalog_operator, init_components, init_tracing, staging_operator, Components};

use handlers::{cancel_run, get_run, health_check, list_runs, ready_check, trigger};

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub staging: StagingStore,
    pub buckets: Vec<String>,
}

impl AppState {
    pub fn from_components(components: &Components) -> Self {
        Self {
            scheduler: components.scheduler.clone(),
            staging: components.staging.clone(),
            buckets: components.buckets.clone(),
        }
    }
}

/// Error type that implements IntoResponse
pub(crate) struct AppError {
    status: StatusCode,
    code: Option<&'static str>,
    error: anyhow::Error,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request error: {:?}", self.error);
        } else {
            info!(status = self.status.as_u16(), "Request rejected: {}", self.error);
        }
        let mut body = json!({ "error": self.error.to_string() });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::RunNotFound { .. } => StatusCode::NOT_FOUND,
            PipelineError::NotCancellable { .. }
            | PipelineError::NoEligibleRun { .. }
            | PipelineError::StageGate { .. } => StatusCode::CONFLICT,
            PipelineError::InvalidConfig { .. } | PipelineError::InvalidGrant { .. } => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::UnauthorizedPrincipal { .. } => StatusCode::FORBIDDEN,
            PipelineError::Throttled { .. }
            | PipelineError::VendorExportFailed { .. }
            | PipelineError::CatalogUnavailable { .. }
            | PipelineError::CatalogRejected { .. }
            | PipelineError::Storage { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: Some(err.code().as_str()),
            error: err.into(),
        }
    }
}

impl AppError {
    pub fn bad_request<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: None,
            error: error.into(),
        }
    }
}

/// Routes of the trigger interface
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/trigger", post(trigger))
        .route("/v1/runs", get(list_runs))
        .route("/v1/runs/:id", get(get_run))
        .route("/v1/runs/:id/cancel", post(cancel_run))
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Entry point for server mode (loads config automatically)
pub async fn run() -> Result<()> {
    let config = RuntimeConfig::load().context("Failed to load configuration")?;
    run_with_config(config).await
}

/// Entry point for server mode with pre-loaded configuration (for CLI usage)
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);

    info!("Server mode - HTTP trigger interface with daily cadence");

    let addr = config.server.listen_addr.clone();
    let components = init_components(&config)?;
    let state = AppState::from_components(&components);

    let shutdown = CancellationToken::new();
    let cadence = if config.schedule.enabled {
        let scheduler = components.scheduler.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move { scheduler.run_cadence(token).await }))
    } else {
        info!("Daily cadence disabled by configuration");
        None
    };

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {}", addr))?;

    info!("Trigger endpoint listening on http://{}", addr);
    info!("Routes:");
    info!("  POST http://{}/v1/trigger         - Start or resume a run", addr);
    info!("  GET  http://{}/v1/runs            - List runs", addr);
    info!("  GET  http://{}/v1/runs/:id        - Run status", addr);
    info!("  POST http://{}/v1/runs/:id/cancel - Cancel an exporting run", addr);
    info!("  GET  http://{}/health             - Health check", addr);
    info!("  GET  http://{}/ready              - Readiness check", addr);
    info!("Press Ctrl+C or send SIGTERM to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Some(handle) = cadence {
        let _ = handle.await;
    }

    info!("Server shutdown complete");

    Ok(())
}
