//! HTTP API for starting and observing healing runs.
//!
//! Provides REST API endpoints for:
//! - Health checks
//! - Starting a run and cancelling it
//! - Querying a run, or every run
//! - Streaming a run's progress as server-sent events

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::events::{ProgressEvent, ProgressLine, RunSummary};
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::registry::RunHandle;
use crate::run::{Run, RunId};

/// Dashboard dev servers always allowed by CORS.
const DEV_ORIGINS: &[&str] = &["http://localhost:3000", "http://localhost:5173"];

/// Server state shared across handlers.
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
}

impl ServerState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    let cors = cors_layer(state.orchestrator.config().frontend_url.as_deref());
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/run", axum::routing::post(start_run_handler))
        .route(
            "/api/run/{run_id}",
            get(get_run_handler).delete(cancel_run_handler),
        )
        .route("/api/run/{run_id}/stream", get(stream_run_handler))
        .route("/api/results", get(results_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn run_server(state: Arc<ServerState>, addr: &str) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Pipeline healer API listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

fn cors_layer(frontend_url: Option<&str>) -> CorsLayer {
    let mut candidates: Vec<&str> = DEV_ORIGINS.to_vec();
    candidates.extend(frontend_url);
    let origins: Vec<HeaderValue> = candidates
        .into_iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim_end_matches('/')) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    runs: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct RunStarted {
    run_id: RunId,
    branch: String,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct RunView {
    #[serde(flatten)]
    run: Run,
    progress: Vec<ProgressLine>,
}

#[derive(Debug, Serialize)]
struct ResultsResponse {
    runs: Vec<RunSummary>,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    run_id: RunId,
    status: &'static str,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn registry_error_response(error: &RegistryError) -> Response {
    let status = match error {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::InvalidBranchName(_) | RegistryError::InvalidRequest(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
    };
    error_response(status, error)
}

async fn lookup(state: &ServerState, run_id: &str) -> Result<Arc<RunHandle>, Response> {
    let id: RunId = run_id
        .parse()
        .map_err(|_| registry_error_response(&RegistryError::NotFound(run_id.to_string())))?;
    state
        .orchestrator
        .registry()
        .get(id)
        .await
        .map_err(|e| registry_error_response(&e))
}

// ============================================================================
// Handlers
// ============================================================================

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "running",
        "service": "pipeline-healer",
    }))
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        runs: state.orchestrator.registry().len().await,
    })
}

async fn start_run_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RunRequest>,
) -> Response {
    info!(repo = %request.repo_url, "Received run request");
    match state.orchestrator.start(request).await {
        Ok(handle) => {
            let run = handle.snapshot().await;
            (
                StatusCode::ACCEPTED,
                Json(RunStarted {
                    run_id: run.id(),
                    branch: run.branch().to_string(),
                    status: "running",
                }),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "Rejected run request");
            registry_error_response(&e)
        }
    }
}

async fn get_run_handler(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<String>,
) -> Response {
    let handle = match lookup(&state, &run_id).await {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    Json(RunView {
        run: handle.snapshot().await,
        progress: handle.progress_lines().await,
    })
    .into_response()
}

async fn cancel_run_handler(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<String>,
) -> Response {
    let handle = match lookup(&state, &run_id).await {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    if handle.snapshot().await.is_finalized() {
        return error_response(StatusCode::CONFLICT, "Run already finished");
    }
    handle.cancel();
    info!(run_id = %handle.id(), "Cancellation requested");
    (
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            run_id: handle.id(),
            status: "cancelling",
        }),
    )
        .into_response()
}

async fn results_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let runs = state
        .orchestrator
        .registry()
        .list()
        .await
        .iter()
        .map(RunSummary::from)
        .collect();
    Json(ResultsResponse { runs })
}

/// Replays retained progress, then follows live events until the run finishes.
async fn stream_run_handler(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<String>,
) -> Response {
    let handle = match lookup(&state, &run_id).await {
        Ok(handle) => handle,
        Err(response) => return response,
    };

    // Every progress line lands in exactly one of history or rx.
    let (rx, history) = handle.subscribe_with_history().await;
    let run = handle.snapshot().await;

    let mut backlog: Vec<ProgressEvent> = history
        .into_iter()
        .map(|line| ProgressEvent::Progress {
            message: line.message,
            timestamp: line.timestamp,
        })
        .collect();
    backlog.push(ProgressEvent::stage(&run));

    let live: BoxStream<'static, ProgressEvent> = match run.outcome() {
        Some(outcome) => {
            backlog.push(ProgressEvent::Finished {
                run_id: run.id(),
                outcome: outcome.clone(),
                timestamp: chrono::Utc::now(),
            });
            stream::empty().boxed()
        }
        None => follow(rx, run.id()).boxed(),
    };

    let events = stream::iter(backlog)
        .chain(live)
        .map(|event| Ok::<_, Infallible>(to_sse(&event)));

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Live events up to and including the final one.
fn follow(
    rx: tokio::sync::broadcast::Receiver<ProgressEvent>,
    run_id: RunId,
) -> impl futures::Stream<Item = ProgressEvent> + Send + 'static {
    stream::unfold((rx, false), move |(mut rx, done)| async move {
        if done {
            return None;
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let last = event.is_final();
                    return Some((event, (rx, last)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%run_id, skipped, "Progress subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

fn to_sse(event: &ProgressEvent) -> Event {
    Event::default()
        .event(event.kind())
        .json_data(event)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}
