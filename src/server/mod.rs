//! Agent server.
//!
//! ```text
//! POST /message   AgentRequest (JSON) → stream of AgentSseEvent (SSE)
//! GET  /health    {"status": "healthy"}
//! ```
//!
//! Each `/message` is handled by the session keyed on
//! `applicationId:traceId`. A session lives while its machine does; requests
//! that end without one are dropped from the registry.

pub mod api;
pub mod models;
pub mod sessions;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::session::SessionDeps;
use api::{AppState, SharedState};
use sessions::SessionManager;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub builder_token: Option<String>,
    pub dev_mode: bool,
}

/// Build the full router with shared state attached.
pub fn build_router(state: SharedState) -> Router {
    api::api_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(config: ServerConfig, deps: SessionDeps) -> Result<()> {
    if config.builder_token.is_none() {
        tracing::warn!("BUILDER_TOKEN is not set; /message accepts unauthenticated requests");
    }

    let state = Arc::new(AppState {
        sessions: SessionManager::new(),
        deps,
        builder_token: config.builder_token,
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "Agent server listening");
    println!("appgen agent server running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => println!("\nShutting down..."),
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::llm::ScriptedLlm;
    use crate::pipeline::InteractionMode;
    use crate::pipeline::actors::{ActorEnv, SearchSettings};
    use crate::snapshot::SnapshotSaver;
    use crate::validate::{FileMap, NoopCompiler};

    fn test_router() -> Router {
        let llm = Arc::new(ScriptedLlm::default());
        let deps = SessionDeps {
            env: ActorEnv::new(llm.clone(), Arc::new(NoopCompiler), SearchSettings::default()),
            agent_llm: llm,
            naming_llm: None,
            template: Arc::new(FileMap::new()),
            snapshots: SnapshotSaver::disabled(),
            mode: InteractionMode::Interactive,
            max_iterations: 1,
        };
        build_router(Arc::new(AppState {
            sessions: SessionManager::new(),
            deps,
            builder_token: Some("token".into()),
        }))
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let response = test_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = test_router()
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_message_is_405() {
        let response = test_router()
            .oneshot(Request::builder().uri("/message").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
