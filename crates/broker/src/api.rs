//! The daemon control API and the combined HTTP/WS router.
//!
//! Bound to loopback; bearer-token authenticated when a token is configured
//! (dev mode leaves it open, like every other surface).

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use bc_domain::Error;
use bc_sessions::{session_id, Session, SessionPhase};

use crate::auth::token_matches;
use crate::cli_ws;
use crate::consumer_ws::{self, close_with};
use crate::coordinator::CreateSessionParams;
use crate::state::AppState;

const MAX_CREATE_BODY: usize = 64 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn app(state: AppState) -> Router {
    let payload_limit = state.config.server.payload_limit_bytes;

    let mut cors = CorsLayer::new();
    if !state.config.server.origins.allowed.is_empty() {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .server
            .origins
            .allowed
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    Router::new()
        .route("/health", get(health))
        .route(
            "/sessions",
            get(list_sessions)
                .post(create_session)
                .layer(DefaultBodyLimit::max(MAX_CREATE_BODY)),
        )
        .route("/sessions/:id", axum::routing::delete(delete_session))
        .route("/ws/consumer/:session_id", get(consumer_ws::consumer_ws))
        .route("/ws/cli/:session_id", get(cli_ws::cli_ws))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(payload_limit))
        .with_state(state)
}

/// Unknown WS paths close with 4000; everything else is a plain 404.
async fn fallback(ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(|socket| close_with(socket, 4000, "unknown path")),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not found" })),
        )
            .into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.api_token_hash else {
        return Ok(()); // dev mode
    };
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token_matches(token, expected) => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or missing bearer token" })),
        )
            .into_response()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DaemonSessionInfo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, serde::Serialize)]
pub struct DaemonSessionInfo {
    pub session_id: String,
    pub adapter: String,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub pid: Option<u32>,
    pub consumer_count: usize,
    pub status: &'static str,
}

fn session_info(state: &AppState, session: &Session) -> DaemonSessionInfo {
    let session_state = session.state();
    DaemonSessionInfo {
        session_id: session.id().to_string(),
        adapter: session.adapter_name(),
        model: session_state.model,
        cwd: session_state.cwd,
        pid: state.coordinator.launcher.pid_for(session.id()),
        consumer_count: session.consumer_count(),
        status: match session.phase() {
            SessionPhase::Starting => "starting",
            SessionPhase::Running => "running",
            SessionPhase::Closed => "closed",
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_millis() as u64,
        "sessions": state.coordinator.repo.len(),
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn list_sessions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    let mut sessions: Vec<DaemonSessionInfo> = state
        .coordinator
        .repo
        .list()
        .iter()
        .map(|session| session_info(&state, session))
        .collect();
    sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    Json(sessions).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    cwd: String,
    #[serde(default)]
    adapter: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default, alias = "permissionMode")]
    permission_mode: Option<String>,
    #[serde(default, alias = "claudeBinary")]
    claude_binary: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    let body: CreateSessionBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid body: {e}") })),
            )
                .into_response();
        }
    };

    let cwd = std::path::Path::new(&body.cwd);
    if !cwd.is_dir() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("cwd {:?} is not a directory", body.cwd) })),
        )
            .into_response();
    }

    match state.coordinator.create_session(CreateSessionParams {
        adapter: body.adapter,
        cwd: Some(body.cwd),
        model: body.model,
        permission_mode: body.permission_mode,
        claude_binary: body.claude_binary,
    }) {
        Ok(session) => (
            StatusCode::CREATED,
            Json(session_info(&state, &session)),
        )
            .into_response(),
        Err(Error::MaxSessionsReached { limit }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": format!("session limit reached ({limit})") })),
        )
            .into_response(),
        Err(e @ Error::SchemaViolation(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /sessions/<uuid>
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    if !session_id::is_valid(&id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid session id" })),
        )
            .into_response();
    }
    match state.coordinator.close_session(&id, "api").await {
        Ok(()) => Json(json!({ "status": "stopped", "sessionId": id })).into_response(),
        Err(Error::UnknownSession(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown session" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use bc_domain::config::Config;
    use std::sync::Arc;

    fn state(token: Option<&str>) -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.auth.token = token.map(str::to_string);
        let coordinator = Coordinator::new(Arc::new(config)).unwrap();
        (dir, AppState::new(coordinator))
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn health_requires_token_when_configured() {
        let (_dir, state) = state(Some("secret"));

        let denied = health(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let ok = health(State(state), bearer("secret")).await;
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dev_mode_is_open() {
        let (_dir, state) = state(None);
        let ok = health(State(state), HeaderMap::new()).await;
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_validates_cwd_and_caps() {
        let (dir, state) = state(None);

        let bad = create_session(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from(r#"{"cwd": "/definitely/not/a/dir"}"#),
        )
        .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let body = format!(r#"{{"cwd": {:?}, "adapter": "codex"}}"#, dir.path());
        let created = create_session(State(state.clone()), HeaderMap::new(), Bytes::from(body)).await;
        assert_eq!(created.status(), StatusCode::CREATED);
        assert_eq!(state.coordinator.repo.len(), 1);
    }

    #[tokio::test]
    async fn delete_handles_bad_and_unknown_ids() {
        let (_dir, state) = state(None);

        let bad = delete_session(
            State(state.clone()),
            HeaderMap::new(),
            Path("nope".to_string()),
        )
        .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let missing = delete_session(
            State(state),
            HeaderMap::new(),
            Path("123e4567-e89b-42d3-a456-426614174000".to_string()),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_stops_an_existing_session() {
        let (dir, state) = state(None);
        let body = format!(r#"{{"cwd": {:?}, "adapter": "codex"}}"#, dir.path());
        create_session(State(state.clone()), HeaderMap::new(), Bytes::from(body)).await;
        let id = state.coordinator.repo.list()[0].id().to_string();

        let stopped = delete_session(State(state.clone()), HeaderMap::new(), Path(id)).await;
        assert_eq!(stopped.status(), StatusCode::OK);
        assert!(state.coordinator.repo.is_empty());
    }
}
