//! The pyrelay HTTP relay.
//!
//! Accepts analyze and execute jobs, runs them on a bounded worker pool
//! (LLM completions through [`llm::LlmBackend`], scripts through
//! [`exec::ScriptRunner`]), and serves their status for polling. Also
//! proxies chat to the LLM with per-user history.

pub mod chat;
pub mod error;
pub mod exec;
pub mod history;
pub mod jobs;
pub mod llm;
pub mod monitors;
pub mod pool;
pub mod prompt;
pub mod safety;
pub mod service;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pyrelay_core::config::RelayConfig;
use pyrelay_core::wire::{
    AnalyzeAccepted, AnalyzeRequest, ChatRequest, CompareRequest, CompareResponse,
    ConnectRequest, ConnectResponse, DisconnectRequest, DisconnectResponse, ExecuteAccepted,
    ExecuteRequest, HealthResponse,
};
use pyrelay_core::Job;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

pub use error::ServeError;
pub use service::{ChatResponse, RelayService};

type AppState = Arc<RelayService>;

// ── Entrypoint ──

/// Bind, serve until `shutdown` is cancelled, then stop all workers.
pub async fn serve(config: RelayConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let model = config.llm.model.clone();
    let llm_url = config.llm.base_url.clone();
    let service = RelayService::from_config(config)?;
    service.spawn_sweeper();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, %llm_url, %model, "pyrelay relay listening");
    println!("pyrelay relay listening on http://{addr}");

    let signal = shutdown.clone();
    axum::serve(listener, router(Arc::clone(&service)))
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await?;

    tracing::info!("shutting down workers");
    service.shutdown().await;
    Ok(())
}

/// Build the router (for testing without binding to a port).
pub fn router(service: Arc<RelayService>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/vscode/connect", post(post_connect))
        .route("/api/vscode/disconnect", post(post_disconnect))
        .route("/api/vscode/auto_analyze", post(post_analyze))
        .route("/api/vscode/auto_status/{id}", get(get_job))
        .route("/api/code/execute", post(post_execute))
        .route("/api/code/result/{id}", get(get_job))
        .route("/api/code/compare", post(post_compare))
        .route("/api/chat", post(post_chat))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

// ── Handlers ──

async fn health(State(service): State<AppState>) -> Json<HealthResponse> {
    Json(service.health())
}

async fn post_connect(
    State(service): State<AppState>,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<Json<ConnectResponse>, ServeError> {
    let Json(req) = payload?;
    Ok(Json(service.connect(req)?))
}

async fn post_disconnect(
    State(service): State<AppState>,
    payload: Result<Json<DisconnectRequest>, JsonRejection>,
) -> Result<Json<DisconnectResponse>, ServeError> {
    let Json(req) = payload?;
    Ok(Json(service.disconnect(req)?))
}

async fn post_analyze(
    State(service): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AnalyzeAccepted>), ServeError> {
    let Json(req) = payload?;
    Ok((StatusCode::ACCEPTED, Json(service.submit_analysis(req)?)))
}

async fn post_execute(
    State(service): State<AppState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ExecuteAccepted>), ServeError> {
    let Json(req) = payload?;
    Ok((StatusCode::ACCEPTED, Json(service.submit_execute(req)?)))
}

async fn get_job(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ServeError> {
    Ok(Json(service.job(&id)?))
}

async fn post_compare(
    State(service): State<AppState>,
    payload: Result<Json<CompareRequest>, JsonRejection>,
) -> Result<Json<CompareResponse>, ServeError> {
    let Json(req) = payload?;
    Ok(Json(service.compare(req).await?))
}

async fn post_chat(
    State(service): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ServeError> {
    let Json(req) = payload?;
    match service.chat(req).await? {
        ChatResponse::Json(value) => Ok(Json(value).into_response()),
        ChatResponse::Stream(stream) => Ok((
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            Body::from_stream(stream),
        )
            .into_response()),
    }
}
