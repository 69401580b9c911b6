//! HTTP request/response surface
//!
//! Thin axum dispatcher in front of the turn orchestrator. It resolves or
//! creates the session for a chat message, owns the idle-session cleanup
//! policy and serves stored artifacts back to callers.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use sdk::{
    ArtifactKind, ArtifactReferences, ChatRequest, ChatResponse, EngineError, ErrorResponse,
    HealthResponse, SessionList, WrenchErrorExt,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactPersistence;
use crate::conductor::TurnOrchestrator;
use crate::db::DataSource;
use crate::session::SessionStore;

/// Shared state of the HTTP surface
pub struct AppState {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub sessions: Arc<SessionStore>,
    pub artifacts: Arc<dyn ArtifactPersistence>,
    pub source: Arc<dyn DataSource>,

    /// Idle sessions beyond this count are evicted
    pub max_sessions: usize,
}

/// Error rendered as an `ErrorResponse` body
#[derive(Debug)]
pub struct ApiError {
    error: EngineError,
    session_id: Option<String>,
}

impl ApiError {
    fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    fn status(&self) -> StatusCode {
        match self.error {
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::SessionNotFound(_) | EngineError::ArtifactNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            session_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Server-side failures only expose the hint; details stay in the log
        let (error, detail) = if status.is_server_error() {
            warn!("Request failed: {}", self.error);
            (self.error.user_hint().to_string(), None)
        } else {
            (self.error.to_string(), Some(self.error.user_hint().to_string()))
        };

        let body = ErrorResponse {
            error,
            detail,
            session_id: self.session_id,
            timestamp: Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the router with all endpoints and a permissive CORS layer
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/chat", post(chat))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/:id", delete(delete_session))
        .route("/v1/sessions/:id/artifacts", get(session_artifacts))
        .route("/v1/download/:kind/:id", get(download))
        .layer(cors)
        .with_state(state)
}

/// Serve until Ctrl-C
pub async fn serve(bind: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "wrench",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "chat": "POST /v1/chat",
            "health": "GET /health",
            "sessions": "GET /v1/sessions",
            "artifacts": "GET /v1/sessions/{id}/artifacts",
            "download": "GET /v1/download/{kind}/{id}",
            "delete_session": "DELETE /v1/sessions/{id}",
        }
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let database_ok = state.source.ping().await;

    Json(HealthResponse {
        status: if database_ok { "healthy" } else { "degraded" }.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if database_ok { "connected" } else { "unavailable" }.to_string(),
    })
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    request.validate()?;

    // Unknown ids are not adopted; the caller gets a fresh session instead
    let session_id = match request.session_id.as_deref() {
        Some(id) if !id.is_empty() && state.sessions.contains(id).await => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    };

    let (_, created) = state.sessions.get_or_create(&session_id).await;
    if created {
        let evicted = state.sessions.evict_idle(state.max_sessions).await;
        for id in &evicted {
            if let Err(e) = state.artifacts.remove_session(id).await {
                warn!(session_id = %id, "Failed to remove artifacts of evicted session: {}", e);
            }
        }
    }

    debug!(session_id = %session_id, created, "Dispatching chat message");
    let turn = state
        .orchestrator
        .execute(&session_id, &request.message)
        .await;

    Ok(Json(ChatResponse::from(turn)))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionList> {
    let sessions = state.sessions.list().await;
    Json(SessionList {
        count: sessions.len(),
        sessions,
    })
}

async fn session_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ArtifactReferences>, ApiError> {
    let session = state
        .sessions
        .snapshot(&id)
        .await
        .ok_or_else(|| ApiError::from(EngineError::SessionNotFound(id.clone())))?;

    Ok(Json(session.artifacts.references()))
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let kind: ArtifactKind = kind
        .parse()
        .map_err(|e: EngineError| ApiError::from(e).with_session(id.as_str()))?;

    let session = state.sessions.snapshot(&id).await.ok_or_else(|| {
        ApiError::from(EngineError::SessionNotFound(id.clone())).with_session(id.as_str())
    })?;

    let not_found =
        || ApiError::from(EngineError::ArtifactNotFound(kind.to_string())).with_session(id.as_str());

    let body = match kind {
        ArtifactKind::Answer => session.artifacts.answer.ok_or_else(not_found)?.into_bytes(),
        _ => {
            let references = session.artifacts.references();
            let reference = references.get(kind).ok_or_else(not_found)?;
            state
                .artifacts
                .load(reference)
                .await
                .map_err(|e| ApiError::from(EngineError::from(e)).with_session(id.as_str()))?
        }
    };

    let disposition = format!(
        "attachment; filename=\"{}_{}.{}\"",
        kind,
        id,
        kind.extension()
    );
    Ok((
        [
            (header::CONTENT_TYPE, kind.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.sessions.remove(&id).await {
        return Err(ApiError::from(EngineError::SessionNotFound(id.clone())).with_session(id));
    }

    if let Err(e) = state.artifacts.remove_session(&id).await {
        warn!(session_id = %id, "Failed to remove session artifacts: {}", e);
    }

    Ok(Json(json!({ "deleted": id })))
}
