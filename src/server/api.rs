use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::stream::{self, Stream};
use tokio::sync::mpsc;

use super::models::{AgentRequest, AgentSseEvent, ErrorResponse};
use super::sessions::SessionManager;
use crate::session::SessionDeps;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub sessions: SessionManager,
    pub deps: SessionDeps,
    /// Bearer token required on `/message`; `None` disables auth.
    pub builder_token: Option<String>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "Unauthorized", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "Forbidden", msg),
        };
        let body = ErrorResponse {
            error: error.to_string(),
            details: Some(details),
        };
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(state: SharedState) -> Router<SharedState> {
    Router::new()
        .route("/message", post(message))
        .route_layer(middleware::from_fn_with_state(state, require_token))
        .route("/health", get(health_check))
}

/// Bearer auth: missing or non-bearer credentials are 401, a wrong token 403.
async fn require_token(State(state): State<SharedState>, request: Request, next: Next) -> Result<Response, ApiError> {
    let Some(expected) = state.builder_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match provided {
        None => {
            tracing::info!("Missing authentication token");
            Err(ApiError::Unauthorized(
                "Unauthorized - missing authentication token".to_string(),
            ))
        }
        Some(token) if token != expected => {
            tracing::info!("Invalid authentication token");
            Err(ApiError::Forbidden(
                "Unauthorized - invalid authentication token".to_string(),
            ))
        }
        Some(_) => Ok(next.run(request).await),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

/// Run the agent for one request and stream its events.
async fn message(
    State(state): State<SharedState>,
    Json(request): Json<AgentRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!(
        application_id = %request.application_id,
        trace_id = %request.trace_id,
        "Received message request"
    );

    let session = state.sessions.get_or_create(&request, &state.deps);
    let (tx, rx) = mpsc::channel::<AgentSseEvent>(16);

    let task_state = state.clone();
    tokio::spawn(async move {
        let key = request.session_key();
        let (has_machine, finished) = {
            let mut session = session.lock().await;
            session.process(&request, tx).await;
            (session.has_machine(), session.is_finished())
        };
        if finished || (request.agent_state.is_none() && !has_machine) {
            task_state.sessions.remove(&key);
        }
    });

    let events = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let json = serde_json::to_string(&event).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize SSE event");
            String::from("{}")
        });
        Some((Ok(Event::default().data(json)), rx))
    });
    Sse::new(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::llm::ScriptedLlm;
    use crate::pipeline::actors::{ActorEnv, SearchSettings};
    use crate::pipeline::InteractionMode;
    use crate::server::models::{AgentStatus, MessageKind};
    use crate::snapshot::SnapshotSaver;
    use crate::validate::{FileMap, NoopCompiler};

    fn test_state(agent_replies: &[&str], token: Option<&str>) -> SharedState {
        let agent = Arc::new(ScriptedLlm::from_texts(agent_replies.iter().copied()));
        let deps = SessionDeps {
            env: ActorEnv::new(
                Arc::new(ScriptedLlm::default()),
                Arc::new(NoopCompiler),
                SearchSettings::default(),
            ),
            agent_llm: agent,
            naming_llm: None,
            template: Arc::new(FileMap::new()),
            snapshots: SnapshotSaver::disabled(),
            mode: InteractionMode::Interactive,
            max_iterations: 3,
        };
        Arc::new(AppState {
            sessions: SessionManager::new(),
            deps,
            builder_token: token.map(str::to_string),
        })
    }

    fn test_app(state: SharedState) -> Router {
        api_router(state.clone()).with_state(state)
    }

    fn message_request(body: serde_json::Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/message")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn valid_body() -> serde_json::Value {
        serde_json::json!({
            "allMessages": [{"role": "user", "content": "hello"}],
            "applicationId": "app",
            "traceId": "trace"
        })
    }

    /// Parse `data:` lines of an SSE body.
    fn parse_events(body: &str) -> Vec<AgentSseEvent> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
            .map(|json| serde_json::from_str(json).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app(test_state(&[], Some("secret")));
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let app = test_app(test_state(&[], Some("secret")));
        let response = app.oneshot(message_request(valid_body(), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_token_is_403() {
        let app = test_app(test_state(&[], Some("secret")));
        let response = app
            .oneshot(message_request(valid_body(), Some("guess")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Forbidden");
    }

    #[tokio::test]
    async fn test_invalid_enum_is_422() {
        let app = test_app(test_state(&[], None));
        let body = serde_json::json!({
            "allMessages": [],
            "applicationId": "app",
            "traceId": "trace",
            "settings": {"interactionMode": "sometimes"}
        });
        let response = app.oneshot(message_request(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    async fn wait_for_cleanup(state: &SharedState) {
        for _ in 0..50 {
            if state.sessions.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_runtime_error_drops_session_with_state() {
        let state = test_state(&[], None);
        let app = test_app(state.clone());
        let mut body = valid_body();
        body["agentState"] = serde_json::json!({});
        let response = app.oneshot(message_request(body, None)).await.unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let events = parse_events(&String::from_utf8_lossy(&body));
        assert_eq!(events.last().unwrap().message.kind, MessageKind::RuntimeError);

        wait_for_cleanup(&state).await;
        assert!(state.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_message_streams_events_and_cleans_up() {
        let state = test_state(&["Hi! What app would you like?"], Some("secret"));
        let app = test_app(state.clone());
        let response = app
            .oneshot(message_request(valid_body(), Some("secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let events = parse_events(&String::from_utf8_lossy(&body));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AgentStatus::Idle);
        assert_eq!(events[0].trace_id, "trace");
        assert_eq!(events[0].message.kind, MessageKind::RefinementRequest);

        // The stream ends when the task drops its sender; cleanup follows it.
        wait_for_cleanup(&state).await;
        assert!(state.sessions.is_empty());
    }
}
