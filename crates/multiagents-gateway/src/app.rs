use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Json, Router,
};
use serde_json::{json, Value};

use crate::runner::SessionRunner;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub runner: Arc<SessionRunner>,
    /// Default agent set for sessions created without an explicit spec.
    pub default_agents: Vec<String>,
}

impl AppState {
    pub fn new(runner: Arc<SessionRunner>, default_agents: Vec<String>) -> Self {
        Self {
            runner,
            default_agents,
        }
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn list_sessions_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store = state.runner.store().clone();
    let sessions = tokio::task::spawn_blocking(move || store.list_sessions())
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();
    Json(json!({
        "sessions": sessions
            .into_iter()
            .map(|(id, title, agents, updated_at)| json!({
                "id": id,
                "title": title,
                "agents": agents,
                "updated_at": updated_at,
            }))
            .collect::<Vec<_>>(),
    }))
}

async fn delete_session_handler(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Json<Value> {
    state.runner.delete_session(&session_id).await;
    Json(json!({"deleted": session_id}))
}

/// Assemble the Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions/{session_id}", delete(delete_session_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
