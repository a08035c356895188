//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method   | Path                 | Description |
//! |----------|----------------------|-------------|
//! | `POST`   | `/query`             | Ask a question, optionally within a session |
//! | `POST`   | `/sync`              | Run a sync pass (`{"full": true}` for a rebuild) |
//! | `POST`   | `/webhook`           | Git push webhook; schedules a background sync |
//! | `POST`   | `/reload`            | Reload configuration and cascade the change |
//! | `DELETE` | `/sessions/{id}`     | Drop one session's history |
//! | `GET`    | `/health`            | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Component failures behind `/query` are logged with full detail but
//! surface to the caller as one uniform `internal` message, so backend
//! topology never leaks through the API.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! clients.

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::App;

/// Shared application handle passed to all route handlers.
#[derive(Clone)]
struct AppState {
    app: Arc<App>,
}

/// Starts the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.registry.settings().await.server.bind.clone();
    let state = AppState { app };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/query", post(handle_query))
        .route("/sync", post(handle_sync))
        .route("/webhook", post(handle_webhook))
        .route("/reload", post(handle_reload))
        .route("/sessions/{id}", delete(handle_clear_session))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(addr = %bind_addr, "http server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

/// The uniform caller-facing failure. The real cause goes to the log.
fn internal() -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: "the request could not be completed".to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct QueryResponse {
    answer: String,
    sources: Vec<String>,
    cached: bool,
    /// Echoed back, or freshly minted when the client sent none. Pass it
    /// on the next request to continue the conversation.
    session_id: String,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let question = request.question.trim();
    if question.is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let session_id = request
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let reply = state
        .app
        .chat
        .ask(Some(&session_id), question)
        .await
        .map_err(|e| {
            error!(error = %e, "query failed");
            internal()
        })?;

    Ok(Json(QueryResponse {
        answer: reply.answer,
        sources: reply.sources,
        cached: reply.cached,
        session_id,
    }))
}

// ============ POST /sync ============

#[derive(Deserialize)]
struct SyncRequest {
    #[serde(default)]
    full: bool,
}

#[derive(Serialize)]
struct SyncResponse {
    scanned: usize,
    synced: usize,
    deleted: usize,
    failed: usize,
    skipped: usize,
}

async fn handle_sync(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SyncResponse>, AppError> {
    // Empty body means an incremental pass.
    let full = if body.is_empty() {
        false
    } else {
        serde_json::from_slice::<SyncRequest>(&body)
            .map_err(|e| bad_request(format!("invalid sync request: {}", e)))?
            .full
    };

    let report = state.app.sync(full).await.map_err(|e| {
        error!(error = %e, "sync failed");
        internal()
    })?;

    Ok(Json(SyncResponse {
        scanned: report.scanned,
        synced: report.synced,
        deleted: report.deleted,
        failed: report.failed.len(),
        skipped: report.skipped,
    }))
}

// ============ POST /webhook ============

#[derive(Deserialize)]
struct PushEvent {
    #[serde(rename = "ref", default)]
    git_ref: Option<String>,
}

#[derive(Serialize)]
struct WebhookResponse {
    status: String,
}

/// Git push webhook. When a shared secret is configured, the request must
/// carry a valid `X-Hub-Signature-256` over the raw body. Pushes to any
/// ref other than the configured branch are acknowledged but ignored; a
/// matching push schedules a background sync pass.
async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    let settings = state.app.registry.settings().await;

    if let Some(secret) = &settings.server.webhook_secret {
        verify_signature(secret, &headers, &body)?;
    }

    let event: PushEvent = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("invalid webhook payload: {}", e)))?;

    match event.git_ref.as_deref() {
        Some(git_ref) if git_ref == settings.server.webhook_branch => {
            let app = state.app.clone();
            tokio::spawn(async move {
                if let Err(e) = app.sync(false).await {
                    error!(error = %e, "webhook-triggered sync failed");
                }
            });
            Ok((
                StatusCode::ACCEPTED,
                Json(WebhookResponse {
                    status: "sync scheduled".to_string(),
                }),
            ))
        }
        other => {
            info!(git_ref = ?other, "webhook push ignored (wrong ref)");
            Ok((
                StatusCode::OK,
                Json(WebhookResponse {
                    status: "ignored".to_string(),
                }),
            ))
        }
    }
}

fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
    let header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("missing X-Hub-Signature-256 header"))?;

    let hex_sig = header
        .strip_prefix("sha256=")
        .ok_or_else(|| unauthorized("malformed signature header"))?;
    let expected =
        hex::decode(hex_sig).map_err(|_| unauthorized("malformed signature header"))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| unauthorized("invalid webhook secret"))?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| {
        warn!("webhook signature mismatch");
        unauthorized("signature mismatch")
    })
}

// ============ POST /reload ============

#[derive(Serialize)]
struct ReloadResponse {
    status: String,
    version: u64,
}

async fn handle_reload(
    State(state): State<AppState>,
) -> Result<Json<ReloadResponse>, AppError> {
    state.app.reload().await.map_err(|e| {
        error!(error = %e, "reload failed");
        internal()
    })?;

    Ok(Json(ReloadResponse {
        status: "reloaded".to_string(),
        version: state.app.registry.version(),
    }))
}

// ============ DELETE /sessions/{id} ============

async fn handle_clear_session(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> StatusCode {
    state.app.chat.clear_session_history(&id).await;
    StatusCode::NO_CONTENT
}
