//! Management HTTP surface over the session registry.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::sequence::SequenceOutcome;
use crate::session::SessionManager;

/// Shared state for the management routes.
#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionManager>,
}

/// Build the management router.
pub fn api_routes(sessions: Arc<SessionManager>) -> Router {
    let state = ApiState { sessions };

    Router::new()
        .route("/health", get(health))
        .route("/ws/events", get(ws_handler))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/start", post(start_session))
        .route("/api/sessions/{id}/stop", post(stop_session))
        .route("/api/sessions/{id}/logout", post(logout_session))
        .route("/api/sessions/{id}/sequences", post(start_sequence))
        .route("/api/sessions/{id}/agenda", post(schedule_message))
        .route("/api/reload/triggers", post(reload_triggers))
        .route("/api/reload/prompt-config", post(reload_prompt_config))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `SessionError` as an HTTP response.
struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::NotFound(_) | SessionError::UnknownSequence { .. } => {
                StatusCode::NOT_FOUND
            }
            SessionError::InvalidId(_) | SessionError::InvalidRecipient { .. } => {
                StatusCode::BAD_REQUEST
            }
            SessionError::Transport(_) => StatusCode::BAD_GATEWAY,
            SessionError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), "Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "session-engine"
    }))
}

async fn list_sessions(State(state): State<ApiState>) -> ApiResult {
    let sessions = state.sessions.list_all().await?;
    Ok(Json(sessions).into_response())
}

async fn get_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(state.sessions.get_state(&id).await?).into_response())
}

async fn start_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(state.sessions.start(&id).await?).into_response())
}

async fn stop_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(state.sessions.stop(&id).await?).into_response())
}

async fn logout_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(state.sessions.logout(&id).await?).into_response())
}

async fn delete_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    state.sessions.delete(&id).await?;
    Ok(Json(json!({ "status": "deleted" })).into_response())
}

#[derive(Debug, Deserialize)]
struct StartSequenceRequest {
    phone: String,
    trigger: String,
    /// Block until the run ends and report its outcome.
    #[serde(default)]
    wait: bool,
}

fn outcome_json(outcome: SequenceOutcome) -> serde_json::Value {
    match outcome {
        SequenceOutcome::Completed => json!({ "status": "completed" }),
        SequenceOutcome::Cancelled => json!({ "status": "cancelled" }),
        SequenceOutcome::Failed(error) => json!({ "status": "failed", "error": error }),
    }
}

async fn start_sequence(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<StartSequenceRequest>,
) -> ApiResult {
    let handle = state
        .sessions
        .start_sequence(&id, &body.phone, &body.trigger)
        .await?;
    info!(session = %id, trigger = %body.trigger, "Sequence started via API");
    if body.wait {
        Ok(Json(outcome_json(handle.wait().await)).into_response())
    } else {
        Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response())
    }
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    phone: String,
    text: String,
    send_at: DateTime<Utc>,
}

async fn schedule_message(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<ScheduleRequest>,
) -> ApiResult {
    let item = state
        .sessions
        .schedule_message(&id, &body.phone, &body.text, body.send_at)
        .await?;
    Ok((StatusCode::CREATED, Json(item)).into_response())
}

async fn reload_triggers(State(state): State<ApiState>) -> impl IntoResponse {
    let sessions = state.sessions.reload_triggers().await;
    Json(json!({ "status": "reloaded", "sessions": sessions }))
}

async fn reload_prompt_config(State(state): State<ApiState>) -> impl IntoResponse {
    state.sessions.reload_prompt_config().await;
    Json(json!({ "status": "reloaded" }))
}

// ── Events WebSocket ────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    debug!("Events WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_sync(socket: &mut WebSocket, state: &ApiState) -> bool {
    let sessions = match state.sessions.list_all().await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!("Failed to load sessions for sync: {e}");
            return true;
        }
    };
    let sync = json!({ "type": "sessions_sync", "sessions": sessions });
    socket
        .send(Message::Text(sync.to_string().into()))
        .await
        .is_ok()
}

/// Sends a full session list on connect and again after lagging, then
/// forwards every lifecycle event as JSON.
async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    let mut rx = state.sessions.subscribe();
    if !send_sync(&mut socket, &state).await {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            debug!("Events WS client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Events WS client lagged behind broadcast");
                        if !send_sync(&mut socket, &state).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!("Events WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::TransportError;
    use crate::store::{Database, LibSqlBackend};
    use crate::testing::{MockFactory, StubLlm};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn router() -> Router {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sessions = SessionManager::new(
            db,
            StubLlm::fixed("{}"),
            Arc::new(MockFactory::default()),
            EngineConfig::default(),
        );
        api_routes(Arc::new(sessions))
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (SessionError::NotFound("a".into()), StatusCode::NOT_FOUND),
            (
                SessionError::UnknownSequence {
                    trigger: "x".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (SessionError::InvalidId("a.b".into()), StatusCode::BAD_REQUEST),
            (
                SessionError::InvalidRecipient { phone: "1".into() },
                StatusCode::BAD_REQUEST,
            ),
            (
                SessionError::Transport(TransportError::SendFailed {
                    recipient: "1".into(),
                    reason: "down".into(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError(error).into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn health_and_empty_list() {
        let (status, body) = call(router().await, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "session-engine");

        let (status, body) = call(router().await, "GET", "/api/sessions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn unknown_and_invalid_sessions() {
        let (status, body) = call(router().await, "GET", "/api/sessions/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nobody"));

        let (status, _) = call(router().await, "DELETE", "/api/sessions/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(router().await, "POST", "/api/sessions/a.b/start").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
