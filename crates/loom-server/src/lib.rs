//! # loom-server
//!
//! HTTP API over a [`TaskEngine`]:
//!
//! - `POST /api/v1/tasks` runs a task and answers with its result
//! - `POST /api/v1/tasks/stream` runs a task and streams its events as SSE
//! - `POST /api/v1/tasks/queue` enqueues a task and answers `202 Accepted`
//! - `GET /api/v1/tasks/{id}` and `GET /api/v1/tasks/{id}/job` report status
//! - `GET /health` and `GET /metrics`

pub mod metrics;

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response, Sse, sse::Event as SseEvent},
    routing::{get, post},
};
use futures::stream::Stream;
use loom_config::schema::ServerConfig;
use loom_core::{ErrorEnvelope, LoomError, Task};
use loom_runtime::{Job, QueueReceipt, QueueSubmission, TaskEngine, TaskResponse, TaskSubmission};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Optional caller identity for status reads. When present, other owners'
/// tasks are reported as not found.
pub const OWNER_HEADER: &str = "x-owner-id";

/// Set on streamed responses so the caller can poll the task afterwards.
pub const TASK_ID_HEADER: &str = "x-task-id";

/// Shared server state.
pub struct AppState {
    pub config: ServerConfig,
    pub engine: TaskEngine,
    pub metrics: metrics::Metrics,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct ListParams {
    owner: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Error answer: an HTTP status and the `{code, message}` envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    envelope: ErrorEnvelope,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            envelope: ErrorEnvelope::new("INVALID_REQUEST", message),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            envelope: ErrorEnvelope::new("UNAUTHORIZED", "invalid or missing API key"),
        }
    }
}

impl From<LoomError> for ApiError {
    fn from(err: LoomError) -> Self {
        let status = match &err {
            LoomError::NotFound(_) => StatusCode::NOT_FOUND,
            LoomError::AlreadyExists(_) => StatusCode::CONFLICT,
            LoomError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            LoomError::IterationLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LoomError::Execution(_) | LoomError::LlmProvider(_) => StatusCode::BAD_GATEWAY,
            LoomError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            envelope: ErrorEnvelope::from(&err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}

/// Build the Axum router.
pub fn build_router(engine: TaskEngine, config: ServerConfig) -> Router {
    let state = Arc::new(AppState {
        config: config.clone(),
        engine,
        metrics: metrics::Metrics::new(),
    });

    let api_routes = Router::new()
        .route("/api/v1/tasks", post(submit_handler).get(list_handler))
        .route("/api/v1/tasks/stream", post(stream_handler))
        .route("/api/v1/tasks/queue", post(queue_handler))
        .route("/api/v1/tasks/{id}", get(status_handler))
        .route("/api/v1/tasks/{id}/job", get(job_handler));

    let api_routes = if config.api_key.is_some() {
        api_routes.layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
    } else {
        api_routes
    };

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(api_routes)
        .layer(middleware::from_fn_with_state(state.clone(), count_middleware))
        .with_state(state);

    if config.cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}

/// Middleware that checks the Authorization header against the configured API key.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(ref expected_key) = state.config.api_key {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match provided {
            Some(key) if key == expected_key => {}
            _ => {
                warn!("unauthorized API request, invalid or missing API key");
                return Err(ApiError::unauthorized());
            }
        }
    }
    Ok(next.run(request).await)
}

async fn count_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    state.metrics.inc_http_requests();
    let response = next.run(request).await;
    if response.status().is_client_error() || response.status().is_server_error() {
        state.metrics.inc_http_errors();
    }
    response
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: state.metrics.uptime_secs(),
    })
}

/// Prometheus-compatible metrics endpoint.
async fn metrics_handler(
    State(state): State<Arc<AppState>>,
) -> (
    StatusCode,
    [(axum::http::header::HeaderName, &'static str); 1],
    String,
) {
    let body = state.metrics.render_prometheus();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

fn check_submission(instruction: &str, owner_id: &str) -> Result<(), ApiError> {
    if instruction.trim().is_empty() {
        return Err(ApiError::bad_request("instruction must not be empty"));
    }
    if owner_id.trim().is_empty() {
        return Err(ApiError::bad_request("ownerId must not be empty"));
    }
    Ok(())
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskSubmission>,
) -> Result<Json<TaskResponse>, ApiError> {
    check_submission(&req.instruction, &req.owner_id)?;
    state.metrics.inc_sync_tasks();

    match state.engine.run(req).await {
        Ok(resp) => {
            state.metrics.record_task(&resp.metadata);
            Ok(Json(resp))
        }
        Err(e) => {
            state.metrics.inc_failed_tasks();
            Err(e.into())
        }
    }
}

/// SSE task handler. Each event is named after its kind and carries the
/// JSON event as data; the stream ends after the terminal event.
async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskSubmission>,
) -> Result<
    (
        [(HeaderName, String); 1],
        Sse<impl Stream<Item = Result<SseEvent, Infallible>>>,
    ),
    ApiError,
> {
    check_submission(&req.instruction, &req.owner_id)?;
    state.metrics.inc_stream_tasks();

    let (tx, mut rx) = mpsc::channel(state.engine.options().stream_buffer);
    // The join handle is dropped: the task outlives the connection.
    let (task_id, _join) = state.engine.spawn_streamed(req, tx).await?;
    info!(task_id = %task_id, "streaming task started");

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(SseEvent::default().event(event.kind()).data(data));
            if terminal {
                break;
            }
        }
    };

    Ok((
        [(HeaderName::from_static(TASK_ID_HEADER), task_id)],
        Sse::new(stream),
    ))
}

async fn queue_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueueSubmission>,
) -> Result<(StatusCode, Json<QueueReceipt>), ApiError> {
    check_submission(&req.instruction, &req.owner_id)?;
    let receipt = state.engine.enqueue(req).await?;
    state.metrics.inc_queued_tasks(receipt.duplicate);
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

fn owner_from(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Task>, ApiError> {
    let task = state.engine.status(&id, owner_from(&headers)).await?;
    Ok(Json(task))
}

async fn job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Job>, ApiError> {
    // Ownership is checked on the task record.
    state.engine.status(&id, owner_from(&headers)).await?;
    let job = state.engine.job(&id).await?;
    Ok(Json(job))
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = state
        .engine
        .tracker()
        .list_for_owner(&params.owner, params.limit.min(500))
        .await?;
    Ok(Json(tasks))
}

/// Serve until `shutdown` fires.
pub async fn start_server(
    engine: TaskEngine,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> loom_core::Result<()> {
    let listen = config.listen.clone();
    let router = build_router(engine, config);

    info!(listen = %listen, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| LoomError::Config(format!("failed to bind {}: {}", listen, e)))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
